//! HTTP surface for the provisioning driver.
//!
//! ```text
//! ┌────────┐  POST /api/session/generate  ┌───────────────────────────────┐
//! │ Client │ ───────────────────────────> │ server.rs  (axum Router)      │
//! │        │  POST /api/session/verify    │   └─ api.rs (handlers)        │
//! │        │  POST /api/session/password  │        │                      │
//! │        │ <─────────────────────────── │        v                      │
//! └────────┘  JSON, camelCase             │ ConversationDriver            │
//!                                         └───────────────────────────────┘
//! ```
//!
//! Each request is stateless; the driver's registry carries the conversation
//! between calls, keyed by phone number.

pub mod api;
pub mod server;
