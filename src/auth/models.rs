//! Core records for user accounts and sponsor patterns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// One registered app user, enrolled under a sponsor via a linking code.
///
/// `password_hash` and `salt` are base64-encoded Argon2id material. They are
/// stored and compared, never logged; the custom `Debug` impl redacts them.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub sponsor_id: String,
    pub linking_code: String,
    pub app_instance_id: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl UserAccount {
    /// Whether the account is locked at `now`.
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

impl std::fmt::Debug for UserAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAccount")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("sponsor_id", &self.sponsor_id)
            .field("failed_attempts", &self.failed_attempts)
            .field("locked_until", &self.locked_until)
            .finish_non_exhaustive()
    }
}

/// Fields supplied when creating an account; the repository assigns the id
/// and timestamps.
#[derive(Clone, Debug)]
pub struct NewUserAccount {
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub sponsor_id: String,
    pub linking_code: String,
    pub app_instance_id: String,
}

/// Maps a linking-code prefix to a sponsor backend.
///
/// Prefixes are compared case-insensitively after normalization; matching is
/// longest-prefix-first among active patterns only. Decommissioning is a soft
/// state change so historically valid codes stay auditable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SponsorPattern {
    pub pattern_prefix: String,
    pub sponsor_id: String,
    pub sponsor_name: String,
    pub portal_url: String,
    pub firestore_project: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub decommissioned_at: Option<DateTime<Utc>>,
}

/// Client-facing configuration for a sponsor.
#[derive(ToSchema, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SponsorConfig {
    pub sponsor_id: String,
    pub sponsor_name: String,
    pub portal_url: String,
    pub session_timeout_seconds: u32,
}

impl SponsorConfig {
    /// Fallback configuration used when sponsor data is unavailable:
    /// neutral branding and a 2-minute session timeout.
    #[must_use]
    pub fn fallback(sponsor_id: &str) -> Self {
        Self {
            sponsor_id: sponsor_id.to_string(),
            sponsor_name: "Study Portal".to_string(),
            portal_url: String::new(),
            session_timeout_seconds: 120,
        }
    }

    #[must_use]
    pub fn for_pattern(pattern: &SponsorPattern) -> Self {
        Self {
            sponsor_id: pattern.sponsor_id.clone(),
            sponsor_name: pattern.sponsor_name.clone(),
            portal_url: pattern.portal_url.clone(),
            session_timeout_seconds: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account(locked_until: Option<DateTime<Utc>>) -> UserAccount {
        UserAccount {
            id: Uuid::new_v4(),
            username: "patient001".to_string(),
            password_hash: "aGFzaA==".to_string(),
            salt: "c2FsdA==".to_string(),
            sponsor_id: "sponsor-a".to_string(),
            linking_code: "CA12345678".to_string(),
            app_instance_id: "device-1".to_string(),
            created_at: Utc::now(),
            last_login_at: None,
            failed_attempts: 0,
            locked_until,
        }
    }

    #[test]
    fn is_locked_respects_future_deadline() {
        let now = Utc::now();
        assert!(account(Some(now + Duration::minutes(5))).is_locked(now));
        assert!(!account(Some(now - Duration::minutes(5))).is_locked(now));
        assert!(!account(None).is_locked(now));
    }

    #[test]
    fn debug_redacts_password_material() {
        let rendered = format!("{:?}", account(None));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("aGFzaA=="));
        assert!(!rendered.contains("c2FsdA=="));
    }

    #[test]
    fn fallback_config_has_two_minute_timeout() {
        let config = SponsorConfig::fallback("sponsor-x");
        assert_eq!(config.session_timeout_seconds, 120);
        assert_eq!(config.sponsor_id, "sponsor-x");
    }
}
