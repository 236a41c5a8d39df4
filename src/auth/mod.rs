//! Authentication core: credential verification, token lifecycle, rate
//! limiting, and sponsor linking-code resolution.
//!
//! The [`AuthService`] orchestrates the leaf components. Every
//! credential-bearing operation follows the same order: rate-limit check
//! first (before any repository or crypto work), then lockout check, then
//! credential verification, then side effects and token issuance. All
//! expected failures fold into [`AuthResult::Failure`]; nothing
//! credential-related escapes as an error.

use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use utoipa::ToSchema;
use uuid::Uuid;

pub mod memory;
pub mod models;
pub mod password;
pub mod patterns;
pub mod postgres;
pub mod rate_limit;
pub mod repository;
pub mod token;

pub use models::{NewUserAccount, SponsorConfig, SponsorPattern, UserAccount};
pub use password::{PasswordError, PasswordParams};
pub use patterns::{PatternMatch, SponsorPatternMatcher};
pub use rate_limit::{RateLimitDecision, SlidingWindowLimiter};
pub use repository::{RepositoryError, SponsorPatternRepository, UserRepository};
pub use token::{SessionClaims, SessionKind, TokenConfig, TokenError, TokenService};

/// Service-level limits and durations.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub max_failed_attempts: i32,
    pub lockout_duration: ChronoDuration,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_window: Duration,
    pub pattern_cache_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_duration: ChronoDuration::minutes(15),
            rate_limit_max_attempts: rate_limit::DEFAULT_MAX_ATTEMPTS,
            rate_limit_window: rate_limit::DEFAULT_WINDOW,
            pattern_cache_ttl: patterns::DEFAULT_CACHE_TTL,
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn with_max_failed_attempts(mut self, max: i32) -> Self {
        self.max_failed_attempts = max;
        self
    }

    #[must_use]
    pub fn with_lockout_duration(mut self, duration: ChronoDuration) -> Self {
        self.lockout_duration = duration;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, max_attempts: u32, window: Duration) -> Self {
        self.rate_limit_max_attempts = max_attempts;
        self.rate_limit_window = window;
        self
    }

    #[must_use]
    pub fn with_pattern_cache_ttl(mut self, ttl: Duration) -> Self {
        self.pattern_cache_ttl = ttl;
        self
    }
}

/// Why an auth operation failed. Stable, client-facing reasons; internal
/// detail stays on the server side of the tracing boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum AuthFailureReason {
    /// Unknown username and wrong password surface identically so usernames
    /// cannot be enumerated.
    InvalidCredentials,
    AccountLocked,
    TokenExpired,
    InvalidToken,
    InvalidLinkingCode,
    UsernameExists,
    RateLimited { retry_after_seconds: u64 },
    Validation,
    Unknown,
}

impl AuthFailureReason {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::AccountLocked => "account_locked",
            Self::TokenExpired => "token_expired",
            Self::InvalidToken => "invalid_token",
            Self::InvalidLinkingCode => "invalid_linking_code",
            Self::UsernameExists => "username_exists",
            Self::RateLimited { .. } => "rate_limited",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Invalid username or password",
            Self::AccountLocked => "Account temporarily locked",
            Self::TokenExpired => "Session expired, sign in again",
            Self::InvalidToken => "Invalid session token",
            Self::InvalidLinkingCode => "Unknown sponsor prefix",
            Self::UsernameExists => "Username already taken",
            Self::RateLimited { .. } => "Too many attempts, try again later",
            Self::Validation => "Invalid request",
            Self::Unknown => "Something went wrong",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthSuccess {
    pub token: String,
    pub user_id: String,
}

/// Sealed outcome of an auth operation; callers must handle both branches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthResult {
    Success(AuthSuccess),
    Failure(AuthFailureReason),
}

impl AuthResult {
    fn failure(reason: AuthFailureReason) -> Self {
        Self::Failure(reason)
    }
}

/// Outcome of a linking-code validation (pure read, safe to retry).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkingCodeValidation {
    Valid(SponsorPattern),
    Invalid,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterRequest {
    pub username: String,
    /// Base64 Argon2id hash computed on the device.
    pub password_hash: String,
    pub salt: String,
    pub linking_code: String,
    pub app_instance_id: String,
    #[serde(default = "SessionKind::mobile")]
    pub session_kind: SessionKind,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// The device's stored linking code, used to scope the username lookup
    /// to one sponsor.
    pub linking_code: String,
    #[serde(default = "SessionKind::mobile")]
    pub session_kind: SessionKind,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password_hash: String,
    pub new_salt: String,
}

impl SessionKind {
    #[must_use]
    pub const fn mobile() -> Self {
        Self::Mobile
    }
}

/// 6 to 50 characters, no `@`, no whitespace.
pub(crate) fn valid_username(username: &str) -> bool {
    Regex::new(r"^[^@\s]{6,50}$").is_ok_and(|regex| regex.is_match(username))
}

pub(crate) fn valid_login_password(password: &str) -> bool {
    !password.is_empty() && password.len() <= 128
}

/// Linking codes must normalize to at least 4 alphanumerics.
pub(crate) fn valid_linking_code(code: &str) -> bool {
    let normalized = patterns::normalize_code(code);
    (4..=32).contains(&normalized.len())
}

pub struct AuthService {
    users: Arc<dyn UserRepository>,
    matcher: SponsorPatternMatcher,
    tokens: TokenService,
    limiter: SlidingWindowLimiter,
    password_params: PasswordParams,
    config: AuthConfig,
}

impl AuthService {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserRepository>,
        sponsor_patterns: Arc<dyn SponsorPatternRepository>,
        tokens: TokenService,
        config: AuthConfig,
    ) -> Self {
        Self {
            users,
            matcher: SponsorPatternMatcher::new(sponsor_patterns, config.pattern_cache_ttl),
            tokens,
            limiter: SlidingWindowLimiter::new(
                config.rate_limit_max_attempts,
                config.rate_limit_window,
            ),
            password_params: PasswordParams::default(),
            config,
        }
    }

    /// Override the Argon2id cost parameters (tests use cheap ones).
    #[must_use]
    pub fn with_password_params(mut self, params: PasswordParams) -> Self {
        self.password_params = params;
        self
    }

    #[must_use]
    pub fn pattern_matcher(&self) -> &SponsorPatternMatcher {
        &self.matcher
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Resolve a linking code to its sponsor. No side effects.
    ///
    /// # Errors
    ///
    /// Repository failures propagate; the handler maps them to the generic
    /// `unknown` reason.
    pub async fn validate_linking_code(
        &self,
        code: &str,
    ) -> Result<LinkingCodeValidation, RepositoryError> {
        if !valid_linking_code(code) {
            return Ok(LinkingCodeValidation::Invalid);
        }
        match self.matcher.find_sponsor_by_linking_code(code).await? {
            PatternMatch::Matched(pattern) => Ok(LinkingCodeValidation::Valid(pattern)),
            PatternMatch::NotMatched => Ok(LinkingCodeValidation::Invalid),
        }
    }

    /// Register a new account under the sponsor resolved from the linking
    /// code. Exactly one account row is created on success; a duplicate
    /// username is an idempotent failure.
    pub async fn register(&self, request: &RegisterRequest, client_ip: &str) -> AuthResult {
        if !valid_username(&request.username)
            || !valid_linking_code(&request.linking_code)
            || password::validate_material(
                &request.password_hash,
                &request.salt,
                &self.password_params,
            )
            .is_err()
        {
            return AuthResult::failure(AuthFailureReason::Validation);
        }

        if let Some(denied) = self.check_rate_limit(client_ip, &request.username) {
            return denied;
        }

        // Sponsor resolution happens before any account mutation; an
        // unmatched code is a hard failure and no account is created.
        let sponsor = match self.matcher.find_sponsor_by_linking_code(&request.linking_code).await {
            Ok(PatternMatch::Matched(pattern)) => pattern,
            Ok(PatternMatch::NotMatched) => {
                return AuthResult::failure(AuthFailureReason::InvalidLinkingCode);
            }
            Err(err) => {
                error!("sponsor pattern lookup failed during registration: {err}");
                return AuthResult::failure(AuthFailureReason::Unknown);
            }
        };

        let account = match self
            .users
            .create_user(NewUserAccount {
                username: request.username.clone(),
                password_hash: request.password_hash.clone(),
                salt: request.salt.clone(),
                sponsor_id: sponsor.sponsor_id.clone(),
                linking_code: patterns::normalize_code(&request.linking_code),
                app_instance_id: request.app_instance_id.clone(),
            })
            .await
        {
            Ok(account) => account,
            Err(RepositoryError::Conflict) => {
                return AuthResult::failure(AuthFailureReason::UsernameExists);
            }
            Err(err) => {
                error!("failed to create user: {err}");
                return AuthResult::failure(AuthFailureReason::Unknown);
            }
        };

        debug!("registered user {} for sponsor {}", account.id, sponsor.sponsor_id);
        self.issue_for(&account.id, request.session_kind)
    }

    /// Verify credentials and mint a session token.
    ///
    /// Unknown username, unmatched linking code, and wrong password all
    /// surface as `invalid_credentials`; a locked account short-circuits
    /// before any password work.
    pub async fn login(&self, request: &LoginRequest, client_ip: &str) -> AuthResult {
        if !valid_username(&request.username) || !valid_login_password(&request.password) {
            return AuthResult::failure(AuthFailureReason::Validation);
        }

        if let Some(denied) = self.check_rate_limit(client_ip, &request.username) {
            return denied;
        }

        let sponsor = match self.matcher.find_sponsor_by_linking_code(&request.linking_code).await {
            Ok(PatternMatch::Matched(pattern)) => pattern,
            Ok(PatternMatch::NotMatched) => {
                return AuthResult::failure(AuthFailureReason::InvalidCredentials);
            }
            Err(err) => {
                error!("sponsor pattern lookup failed during login: {err}");
                return AuthResult::failure(AuthFailureReason::Unknown);
            }
        };

        let user = match self
            .users
            .get_user_by_username(&request.username, &sponsor.sponsor_id)
            .await
        {
            Ok(Some(user)) => user,
            Ok(None) => return AuthResult::failure(AuthFailureReason::InvalidCredentials),
            Err(err) => {
                error!("user lookup failed during login: {err}");
                return AuthResult::failure(AuthFailureReason::Unknown);
            }
        };

        if user.is_locked(Utc::now()) {
            return AuthResult::failure(AuthFailureReason::AccountLocked);
        }

        if !self
            .verify_password(
                request.password.clone(),
                user.salt.clone(),
                user.password_hash.clone(),
            )
            .await
        {
            self.record_failed_attempt(&user).await;
            return AuthResult::failure(AuthFailureReason::InvalidCredentials);
        }

        self.record_successful_login(user, request.session_kind).await
    }

    /// Exchange a token inside its refresh window for a fresh one.
    pub async fn refresh_token(&self, token: &str) -> AuthResult {
        let now = Utc::now().timestamp();
        let claims = match self.tokens.verify(token, now) {
            Ok(claims) => claims,
            Err(TokenError::Expired) => {
                return AuthResult::failure(AuthFailureReason::TokenExpired);
            }
            Err(_) => return AuthResult::failure(AuthFailureReason::InvalidToken),
        };

        match self.tokens.refresh(token, now) {
            Ok(fresh) => AuthResult::Success(AuthSuccess {
                token: fresh,
                user_id: claims.sub,
            }),
            Err(TokenError::Expired) => AuthResult::failure(AuthFailureReason::TokenExpired),
            Err(TokenError::NotRefreshable) => {
                AuthResult::failure(AuthFailureReason::InvalidToken)
            }
            Err(err) => {
                error!("token refresh failed: {err}");
                AuthResult::failure(AuthFailureReason::InvalidToken)
            }
        }
    }

    /// Replace the caller's password material after verifying the current
    /// password. Failure reasons mirror login's.
    pub async fn change_password(
        &self,
        token: &str,
        request: &ChangePasswordRequest,
        client_ip: &str,
    ) -> AuthResult {
        let claims = match self.tokens.verify(token, Utc::now().timestamp()) {
            Ok(claims) => claims,
            Err(TokenError::Expired) => {
                return AuthResult::failure(AuthFailureReason::TokenExpired);
            }
            Err(_) => return AuthResult::failure(AuthFailureReason::InvalidToken),
        };

        let Ok(user_id) = Uuid::parse_str(&claims.sub) else {
            return AuthResult::failure(AuthFailureReason::InvalidToken);
        };

        if !valid_login_password(&request.current_password)
            || password::validate_material(
                &request.new_password_hash,
                &request.new_salt,
                &self.password_params,
            )
            .is_err()
        {
            return AuthResult::failure(AuthFailureReason::Validation);
        }

        // Rate limit before any repository or crypto work; the token subject
        // is the principal here.
        if let Some(denied) = self.check_rate_limit(client_ip, &claims.sub) {
            return denied;
        }

        let mut user = match self.users.get_user_by_id(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return AuthResult::failure(AuthFailureReason::InvalidCredentials),
            Err(err) => {
                error!("user lookup failed during password change: {err}");
                return AuthResult::failure(AuthFailureReason::Unknown);
            }
        };

        if user.is_locked(Utc::now()) {
            return AuthResult::failure(AuthFailureReason::AccountLocked);
        }

        if !self
            .verify_password(
                request.current_password.clone(),
                user.salt.clone(),
                user.password_hash.clone(),
            )
            .await
        {
            self.record_failed_attempt(&user).await;
            return AuthResult::failure(AuthFailureReason::InvalidCredentials);
        }

        user.password_hash = request.new_password_hash.clone();
        user.salt = request.new_salt.clone();
        if let Err(err) = self.users.update_user(&user).await {
            error!("failed to persist new password material: {err}");
            return AuthResult::failure(AuthFailureReason::Unknown);
        }
        if let Err(err) = self.users.reset_failed_attempts(user.id).await {
            warn!("failed to reset attempts after password change: {err}");
        }

        self.issue_for(&user.id, claims.kind)
    }

    /// Client configuration for a sponsor, with a documented fallback when
    /// sponsor data is unavailable. Pure read.
    pub async fn get_sponsor_config(&self, sponsor_id: &str) -> SponsorConfig {
        match self.matcher.get_active_patterns().await {
            Ok(patterns) => patterns
                .iter()
                .find(|pattern| pattern.sponsor_id == sponsor_id)
                .map_or_else(
                    || SponsorConfig::fallback(sponsor_id),
                    SponsorConfig::for_pattern,
                ),
            Err(err) => {
                warn!("sponsor config lookup failed, serving fallback: {err}");
                SponsorConfig::fallback(sponsor_id)
            }
        }
    }

    fn check_rate_limit(&self, client_ip: &str, principal: &str) -> Option<AuthResult> {
        match self.limiter.check_and_record(&format!("{client_ip}:{principal}")) {
            RateLimitDecision::Allowed => None,
            RateLimitDecision::Denied { retry_after } => {
                Some(AuthResult::failure(AuthFailureReason::RateLimited {
                    retry_after_seconds: retry_after.as_secs().max(1),
                }))
            }
        }
    }

    /// Argon2id is deliberately expensive; run it off the async workers. A
    /// failed or malformed verification is treated as a wrong password
    /// (fail closed), never as success.
    async fn verify_password(&self, password: String, salt: String, stored_hash: String) -> bool {
        let params = self.password_params;
        let result = tokio::task::spawn_blocking(move || {
            password::verify_password(&password, &salt, &stored_hash, &params)
        })
        .await;

        match result {
            Ok(Ok(verified)) => verified,
            Ok(Err(err)) => {
                error!("password verification errored, failing closed: {err}");
                false
            }
            Err(err) => {
                error!("password verification task failed, failing closed: {err}");
                false
            }
        }
    }

    async fn record_failed_attempt(&self, user: &UserAccount) {
        let attempts = match self.users.increment_failed_attempts(user.id).await {
            Ok(attempts) => attempts,
            Err(err) => {
                error!("failed to record failed attempt for {}: {err}", user.id);
                return;
            }
        };

        if attempts >= self.config.max_failed_attempts {
            let until = Utc::now() + self.config.lockout_duration;
            match self.users.lock_account(user.id, until).await {
                Ok(true) => {
                    warn!("account {} locked until {until} after {attempts} failures", user.id);
                }
                Ok(false) => {}
                Err(err) => error!("failed to lock account {}: {err}", user.id),
            }
        }
    }

    async fn record_successful_login(&self, user: UserAccount, kind: SessionKind) -> AuthResult {
        if let Err(err) = self.users.reset_failed_attempts(user.id).await {
            error!("failed to reset attempts for {}: {err}", user.id);
            return AuthResult::failure(AuthFailureReason::Unknown);
        }

        let mut updated = user;
        updated.failed_attempts = 0;
        updated.locked_until = None;
        updated.last_login_at = Some(Utc::now());
        if let Err(err) = self.users.update_user(&updated).await {
            warn!("failed to record last login for {}: {err}", updated.id);
        }

        self.issue_for(&updated.id, kind)
    }

    fn issue_for(&self, user_id: &Uuid, kind: SessionKind) -> AuthResult {
        match self
            .tokens
            .issue(&user_id.to_string(), kind, Utc::now().timestamp())
        {
            Ok(token) => AuthResult::Success(AuthSuccess {
                token,
                user_id: user_id.to_string(),
            }),
            Err(err) => {
                error!("token issuance failed: {err}");
                AuthResult::failure(AuthFailureReason::Unknown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(valid_username("patient001"));
        assert!(valid_username("abc123"));
        assert!(!valid_username("short"));
        assert!(!valid_username("user@example.com"));
        assert!(!valid_username("has space"));
        assert!(!valid_username(&"x".repeat(51)));
        assert!(valid_username(&"x".repeat(50)));
    }

    #[test]
    fn login_password_rules() {
        assert!(valid_login_password("hunter2!"));
        assert!(!valid_login_password(""));
        assert!(!valid_login_password(&"x".repeat(129)));
    }

    #[test]
    fn linking_code_rules() {
        assert!(valid_linking_code("CA12345678"));
        assert!(valid_linking_code("call-1234"));
        assert!(!valid_linking_code("ca"));
        assert!(!valid_linking_code("---"));
        assert!(!valid_linking_code(&"A".repeat(40)));
    }

    #[test]
    fn failure_reasons_have_stable_codes() {
        assert_eq!(AuthFailureReason::InvalidCredentials.code(), "invalid_credentials");
        assert_eq!(AuthFailureReason::AccountLocked.code(), "account_locked");
        assert_eq!(
            AuthFailureReason::RateLimited {
                retry_after_seconds: 30
            }
            .code(),
            "rate_limited"
        );
    }

    #[test]
    fn failure_reason_serializes_with_tag() {
        let value = serde_json::to_value(AuthFailureReason::RateLimited {
            retry_after_seconds: 42,
        })
        .expect("serializes");
        assert_eq!(value["error"], "rate_limited");
        assert_eq!(value["retry_after_seconds"], 42);

        let value =
            serde_json::to_value(AuthFailureReason::InvalidCredentials).expect("serializes");
        assert_eq!(value["error"], "invalid_credentials");
    }
}
