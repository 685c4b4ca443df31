use std::collections::BTreeMap;

use anketa_session::ControllerError;
use anketa_store::SessionStoreError;
use anketa_types::AnketaRecord;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::CredentialError;

/// JSON error body `{"error":{"type","code","message"}}` with its HTTP status.
#[derive(Debug)]
pub(super) struct GatewayApiError {
    pub(super) status: StatusCode,
    pub(super) code: &'static str,
    pub(super) message: String,
}

impl GatewayApiError {
    pub(super) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub(super) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(super) fn not_found(session_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "session_not_found",
            format!("session '{session_id}' not found"),
        )
    }

    pub(super) fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub(super) fn credential_failure(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "credential_unavailable", message)
    }

    pub(super) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for GatewayApiError {
    fn into_response(self) -> Response {
        let error_type = if self.status.is_client_error() {
            "invalid_request_error"
        } else {
            "server_error"
        };
        (
            self.status,
            Json(json!({
                "error": {
                    "type": error_type,
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

impl From<ControllerError> for GatewayApiError {
    fn from(error: ControllerError) -> Self {
        match error {
            ControllerError::NotFound(session_id)
            | ControllerError::Store(SessionStoreError::SessionNotFound(session_id)) => {
                Self::not_found(&session_id)
            }
            ControllerError::InvalidTransition(error) => {
                Self::conflict("invalid_transition", error.to_string())
            }
            ControllerError::Store(SessionStoreError::VoiceConfig(error)) => {
                Self::bad_request("locked_setting", error.to_string())
            }
            ControllerError::Store(error) => {
                tracing::error!(error = %error, "session store failure");
                Self::internal(error.to_string())
            }
        }
    }
}

impl From<SessionStoreError> for GatewayApiError {
    fn from(error: SessionStoreError) -> Self {
        ControllerError::from(error).into()
    }
}

impl From<CredentialError> for GatewayApiError {
    fn from(error: CredentialError) -> Self {
        tracing::warn!(error = %error, "join credential could not be issued");
        Self::credential_failure(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct AnketaUpdateRequest {
    pub(super) anketa: AnketaRecord,
}

#[derive(Debug, Deserialize)]
pub(super) struct VoiceConfigUpdateRequest {
    pub(super) editable: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub(super) struct DialogueAppendRequest {
    pub(super) role: String,
    pub(super) content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct AgentSignalsQuery {
    #[serde(default)]
    pub(super) session_id: Option<String>,
}
