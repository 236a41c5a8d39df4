use crate::auth::AuthFailureReason;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub token: String,
    pub user_id: String,
}

/// Stable error body: `error` is a machine-readable code, `message` a short
/// human-readable line. Internal detail never crosses this boundary.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ErrorResponse {
    #[must_use]
    pub fn from_reason(reason: &AuthFailureReason) -> Self {
        let retry_after_seconds = match reason {
            AuthFailureReason::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        };
        Self {
            error: reason.code().to_string(),
            message: reason.message().to_string(),
            retry_after_seconds,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LinkingCodeRequest {
    pub linking_code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LinkingCodeResponse {
    pub valid: bool,
    pub sponsor_id: String,
    pub sponsor_name: String,
    pub portal_url: String,
}
