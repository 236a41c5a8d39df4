//! Repository traits the auth core consumes.
//!
//! Implementations live behind these traits: Postgres for deployments
//! ([`super::postgres`]) and in-memory stores for tests and local runs
//! ([`super::memory`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::models::{NewUserAccount, SponsorPattern, UserAccount};

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Uniqueness constraint hit, e.g. duplicate `(username, sponsor_id)`.
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Account storage. `create_user` must enforce the `(username, sponsor_id)`
/// uniqueness constraint atomically.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_user(&self, user: NewUserAccount) -> Result<UserAccount, RepositoryError>;

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, RepositoryError>;

    async fn get_user_by_username(
        &self,
        username: &str,
        sponsor_id: &str,
    ) -> Result<Option<UserAccount>, RepositoryError>;

    async fn update_user(&self, user: &UserAccount) -> Result<(), RepositoryError>;

    /// Atomically increment the failed-attempt counter and return the new
    /// value. Concurrent callers must not lose updates.
    async fn increment_failed_attempts(&self, id: Uuid) -> Result<i32, RepositoryError>;

    /// Zero the failed-attempt counter and clear any lockout.
    async fn reset_failed_attempts(&self, id: Uuid) -> Result<(), RepositoryError>;

    /// Lock the account until `until`. Returns `true` when this call made the
    /// transition; a call against an already-locked account is a no-op
    /// returning `false`, so concurrent failures produce one transition.
    async fn lock_account(&self, id: Uuid, until: DateTime<Utc>)
        -> Result<bool, RepositoryError>;
}

/// Sponsor prefix-pattern storage. Patterns are soft-deleted only.
#[async_trait]
pub trait SponsorPatternRepository: Send + Sync {
    /// All patterns with `active = true`.
    async fn get_all_active_patterns(&self) -> Result<Vec<SponsorPattern>, RepositoryError>;

    /// Longest-prefix match over active patterns for an already-normalized
    /// code. The cache-backed matcher is the usual entry point; this is the
    /// uncached store-level lookup.
    async fn find_by_linking_code(
        &self,
        normalized_code: &str,
    ) -> Result<Option<SponsorPattern>, RepositoryError>;

    async fn create_pattern(&self, pattern: SponsorPattern) -> Result<(), RepositoryError>;

    /// Soft-delete every pattern for the sponsor: mark inactive and stamp
    /// `decommissioned_at`. The rows stay for auditability.
    async fn decommission_pattern(&self, sponsor_id: &str) -> Result<(), RepositoryError>;
}
