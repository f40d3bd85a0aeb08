pub mod artifact;
pub mod channel;
pub mod config;
pub mod driver;
pub mod errors;
pub mod guard;
pub mod http;
pub mod logging;
pub mod registry;
pub mod transcript;
