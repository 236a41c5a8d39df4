//! Auth endpoint handlers.
//!
//! Handlers translate [`AuthResult`] into HTTP. The service folds every
//! expected failure into a reason; the mapping here is mechanical and the
//! error body shape is the same for every endpoint.

use crate::api::handlers::{client_ip, types};
use crate::auth::{
    token::extract_bearer, AuthFailureReason, AuthResult, AuthService, ChangePasswordRequest,
    LinkingCodeValidation, LoginRequest, RegisterRequest,
};
use axum::{
    extract::{Extension, Path},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::error;

fn failure_status(reason: &AuthFailureReason) -> StatusCode {
    match reason {
        AuthFailureReason::InvalidCredentials
        | AuthFailureReason::TokenExpired
        | AuthFailureReason::InvalidToken => StatusCode::UNAUTHORIZED,
        AuthFailureReason::AccountLocked => StatusCode::LOCKED,
        AuthFailureReason::InvalidLinkingCode => StatusCode::NOT_FOUND,
        AuthFailureReason::UsernameExists => StatusCode::CONFLICT,
        AuthFailureReason::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AuthFailureReason::Validation => StatusCode::BAD_REQUEST,
        AuthFailureReason::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond(result: AuthResult, success_status: StatusCode) -> Response {
    match result {
        AuthResult::Success(success) => (
            success_status,
            Json(types::TokenResponse {
                token: success.token,
                user_id: success.user_id,
            }),
        )
            .into_response(),
        AuthResult::Failure(reason) => (
            failure_status(&reason),
            Json(types::ErrorResponse::from_reason(&reason)),
        )
            .into_response(),
    }
}

fn missing_payload() -> Response {
    let reason = AuthFailureReason::Validation;
    (
        failure_status(&reason),
        Json(types::ErrorResponse::from_reason(&reason)),
    )
        .into_response()
}

fn unauthenticated() -> Response {
    let reason = AuthFailureReason::InvalidToken;
    (
        failure_status(&reason),
        Json(types::ErrorResponse::from_reason(&reason)),
    )
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer)
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses (
        (status = 201, description = "Account created, session token issued", body = types::TokenResponse),
        (status = 404, description = "Linking code matches no sponsor", body = types::ErrorResponse),
        (status = 409, description = "Username already taken under this sponsor", body = types::ErrorResponse),
        (status = 429, description = "Too many attempts", body = types::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn register(
    auth: Extension<Arc<AuthService>>,
    headers: HeaderMap,
    payload: Option<Json<RegisterRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let ip = client_ip(&headers);
    respond(auth.register(&request, &ip).await, StatusCode::CREATED)
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses (
        (status = 200, description = "Session token issued", body = types::TokenResponse),
        (status = 401, description = "Invalid username or password", body = types::ErrorResponse),
        (status = 423, description = "Account temporarily locked", body = types::ErrorResponse),
        (status = 429, description = "Too many attempts", body = types::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn login(
    auth: Extension<Arc<AuthService>>,
    headers: HeaderMap,
    payload: Option<Json<LoginRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let ip = client_ip(&headers);
    respond(auth.login(&request, &ip).await, StatusCode::OK)
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    responses (
        (status = 200, description = "Fresh session token issued", body = types::TokenResponse),
        (status = 401, description = "Token expired, invalid, or outside its refresh window", body = types::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn refresh(
    auth: Extension<Arc<AuthService>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return unauthenticated();
    };
    respond(auth.refresh_token(token).await, StatusCode::OK)
}

#[utoipa::path(
    post,
    path = "/v1/auth/password",
    request_body = ChangePasswordRequest,
    responses (
        (status = 200, description = "Password changed, fresh session token issued", body = types::TokenResponse),
        (status = 401, description = "Wrong current password or invalid token", body = types::ErrorResponse),
        (status = 423, description = "Account temporarily locked", body = types::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn change_password(
    auth: Extension<Arc<AuthService>>,
    headers: HeaderMap,
    payload: Option<Json<ChangePasswordRequest>>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return unauthenticated();
    };
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let ip = client_ip(&headers);
    respond(
        auth.change_password(token, &request, &ip).await,
        StatusCode::OK,
    )
}

#[utoipa::path(
    post,
    path = "/v1/auth/linking-code",
    request_body = types::LinkingCodeRequest,
    responses (
        (status = 200, description = "Linking code matches a sponsor", body = types::LinkingCodeResponse),
        (status = 404, description = "No active sponsor pattern matches", body = types::ErrorResponse),
    ),
    tag = "auth"
)]
pub async fn validate_linking_code(
    auth: Extension<Arc<AuthService>>,
    payload: Option<Json<types::LinkingCodeRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };

    match auth.validate_linking_code(&request.linking_code).await {
        Ok(LinkingCodeValidation::Valid(pattern)) => (
            StatusCode::OK,
            Json(types::LinkingCodeResponse {
                valid: true,
                sponsor_id: pattern.sponsor_id,
                sponsor_name: pattern.sponsor_name,
                portal_url: pattern.portal_url,
            }),
        )
            .into_response(),
        Ok(LinkingCodeValidation::Invalid) => {
            let reason = AuthFailureReason::InvalidLinkingCode;
            (
                failure_status(&reason),
                Json(types::ErrorResponse::from_reason(&reason)),
            )
                .into_response()
        }
        Err(err) => {
            error!("linking code validation failed: {err}");
            let reason = AuthFailureReason::Unknown;
            (
                failure_status(&reason),
                Json(types::ErrorResponse::from_reason(&reason)),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/sponsors/{sponsor_id}/config",
    params(("sponsor_id" = String, Path, description = "Sponsor identifier")),
    responses (
        (status = 200, description = "Sponsor configuration, fallback when unknown", body = crate::auth::models::SponsorConfig),
    ),
    tag = "auth"
)]
pub async fn sponsor_config(
    auth: Extension<Arc<AuthService>>,
    Path(sponsor_id): Path<String>,
) -> impl IntoResponse {
    Json(auth.get_sponsor_config(&sponsor_id).await)
}
