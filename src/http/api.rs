use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::artifact::Artifact;
use crate::driver::{ConversationDriver, StartOutcome, SubmitOutcome};
use crate::errors::ProvisionError;
use crate::registry::PendingSummary;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub driver: ConversationDriver,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub verification_code: String,
    #[serde(default, rename = "password2FA")]
    pub password_2fa: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordRequest {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default)]
    pub phone_number: String,
}

// ── Response types ────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for_code: Option<bool>,
    #[serde(default, rename = "needs2FA", skip_serializing_if = "Option::is_none")]
    pub needs_2fa: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Base64 of the session file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

impl SessionResponse {
    fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn waiting_for_code() -> Self {
        Self {
            success: true,
            waiting_for_code: Some(true),
            message: Some("Verification code sent. Submit it to complete the login.".to_string()),
            ..Default::default()
        }
    }

    fn needs_second_factor() -> Self {
        Self {
            success: false,
            needs_2fa: Some(true),
            message: Some(
                "Two-factor authentication is enabled. Submit the account password.".to_string(),
            ),
            ..Default::default()
        }
    }

    fn completed(artifact: Artifact) -> Self {
        Self {
            success: true,
            session_file: Some(artifact.base64),
            size: Some(artifact.size),
            ..Default::default()
        }
    }
}

impl From<SubmitOutcome> for SessionResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::NeedsSecondFactor => Self::needs_second_factor(),
            SubmitOutcome::Completed(artifact) => Self::completed(artifact),
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Provision(ProvisionError),
    BadRequest(String),
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        ApiError::Provision(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// HTTP status for each driver error.
pub fn status_for(err: &ProvisionError) -> StatusCode {
    match err {
        ProvisionError::Validation(_) => StatusCode::BAD_REQUEST,
        ProvisionError::NotFound { .. } => StatusCode::NOT_FOUND,
        ProvisionError::AlreadyPending { .. } | ProvisionError::StageMismatch { .. } => {
            StatusCode::CONFLICT
        }
        ProvisionError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Provision(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!(error = %err, kind = err.kind(), "Request failed");
                }
                (status, err.kind(), err.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "validation", msg),
        };
        (
            status,
            Json(serde_json::json!({"success": false, "error": kind, "message": message})),
        )
            .into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/session/generate", post(generate_session))
        .route("/api/session/verify", post(verify_code))
        .route("/api/session/password", post(submit_password))
        .route("/api/session/cancel", post(cancel_session))
        .route("/api/session/pending", get(list_pending))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn generate_session(
    State(state): State<SharedState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, ApiError> {
    let Json(req) = payload?;
    let response = match state.driver.start(&req.phone_number).await? {
        StartOutcome::WaitingForCode => SessionResponse::waiting_for_code(),
        StartOutcome::Completed(artifact) => SessionResponse::completed(artifact),
    };
    Ok(Json(response))
}

async fn verify_code(
    State(state): State<SharedState>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, ApiError> {
    let Json(req) = payload?;
    let password = req
        .password_2fa
        .as_deref()
        .filter(|p| !p.trim().is_empty());
    let outcome = state
        .driver
        .submit_code(&req.phone_number, &req.verification_code, password)
        .await?;
    Ok(Json(outcome.into()))
}

async fn submit_password(
    State(state): State<SharedState>,
    payload: Result<Json<PasswordRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, ApiError> {
    let Json(req) = payload?;
    let outcome = state
        .driver
        .submit_second_factor(&req.phone_number, &req.password)
        .await?;
    Ok(Json(outcome.into()))
}

async fn cancel_session(
    State(state): State<SharedState>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, ApiError> {
    let Json(req) = payload?;
    state.driver.cancel(&req.phone_number).await?;
    Ok(Json(SessionResponse::ok()))
}

async fn list_pending(State(state): State<SharedState>) -> Json<Vec<PendingSummary>> {
    Json(state.driver.pending())
}
