//! In-memory repository implementations.
//!
//! Same traits as the Postgres stores, backed by mutex-guarded maps. Used by
//! the test suite and local runs without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::models::{NewUserAccount, SponsorPattern, UserAccount};
use super::patterns::normalize_code;
use super::repository::{RepositoryError, SponsorPatternRepository, UserRepository};

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: Mutex<HashMap<Uuid, UserAccount>>,
}

impl InMemoryUserRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, UserAccount>> {
        self.users.lock().expect("user store poisoned")
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create_user(&self, user: NewUserAccount) -> Result<UserAccount, RepositoryError> {
        let mut users = self.lock();
        let duplicate = users
            .values()
            .any(|existing| existing.username == user.username && existing.sponsor_id == user.sponsor_id);
        if duplicate {
            return Err(RepositoryError::Conflict);
        }

        let account = UserAccount {
            id: Uuid::new_v4(),
            username: user.username,
            password_hash: user.password_hash,
            salt: user.salt,
            sponsor_id: user.sponsor_id,
            linking_code: user.linking_code,
            app_instance_id: user.app_instance_id,
            created_at: Utc::now(),
            last_login_at: None,
            failed_attempts: 0,
            locked_until: None,
        };
        users.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, RepositoryError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn get_user_by_username(
        &self,
        username: &str,
        sponsor_id: &str,
    ) -> Result<Option<UserAccount>, RepositoryError> {
        Ok(self
            .lock()
            .values()
            .find(|user| user.username == username && user.sponsor_id == sponsor_id)
            .cloned())
    }

    async fn update_user(&self, user: &UserAccount) -> Result<(), RepositoryError> {
        let mut users = self.lock();
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn increment_failed_attempts(&self, id: Uuid) -> Result<i32, RepositoryError> {
        let mut users = self.lock();
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.failed_attempts += 1;
        Ok(user.failed_attempts)
    }

    async fn reset_failed_attempts(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut users = self.lock();
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.failed_attempts = 0;
        user.locked_until = None;
        Ok(())
    }

    async fn lock_account(
        &self,
        id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut users = self.lock();
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if user.is_locked(Utc::now()) {
            return Ok(false);
        }
        user.locked_until = Some(until);
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemorySponsorPatternRepository {
    patterns: Mutex<Vec<SponsorPattern>>,
}

impl InMemorySponsorPatternRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_patterns(patterns: Vec<SponsorPattern>) -> Self {
        Self {
            patterns: Mutex::new(patterns),
        }
    }
}

#[async_trait]
impl SponsorPatternRepository for InMemorySponsorPatternRepository {
    async fn get_all_active_patterns(&self) -> Result<Vec<SponsorPattern>, RepositoryError> {
        let patterns = self.patterns.lock().expect("pattern store poisoned");
        Ok(patterns.iter().filter(|p| p.active).cloned().collect())
    }

    async fn find_by_linking_code(
        &self,
        normalized_code: &str,
    ) -> Result<Option<SponsorPattern>, RepositoryError> {
        let mut active = self.get_all_active_patterns().await?;
        active.sort_by(|a, b| {
            b.pattern_prefix
                .len()
                .cmp(&a.pattern_prefix.len())
                .then_with(|| a.pattern_prefix.cmp(&b.pattern_prefix))
        });
        Ok(active.into_iter().find(|pattern| {
            let prefix = normalize_code(&pattern.pattern_prefix);
            !prefix.is_empty() && normalized_code.starts_with(&prefix)
        }))
    }

    async fn create_pattern(&self, pattern: SponsorPattern) -> Result<(), RepositoryError> {
        let mut patterns = self.patterns.lock().expect("pattern store poisoned");
        let duplicate = patterns
            .iter()
            .any(|existing| existing.pattern_prefix == pattern.pattern_prefix);
        if duplicate {
            return Err(RepositoryError::Conflict);
        }
        patterns.push(pattern);
        Ok(())
    }

    async fn decommission_pattern(&self, sponsor_id: &str) -> Result<(), RepositoryError> {
        let mut patterns = self.patterns.lock().expect("pattern store poisoned");
        let mut touched = false;
        for pattern in patterns.iter_mut().filter(|p| p.sponsor_id == sponsor_id) {
            pattern.active = false;
            pattern.decommissioned_at = Some(Utc::now());
            touched = true;
        }
        if touched {
            Ok(())
        } else {
            Err(RepositoryError::NotFound)
        }
    }
}
