//! Postgres-backed repositories.
//!
//! Runtime-checked sqlx queries with instrumented spans. The uniqueness
//! constraint on `(username, sponsor_id)` lives on the table; SQLSTATE 23505
//! maps to [`RepositoryError::Conflict`]. Failed-attempt increments use
//! `UPDATE ... RETURNING` so concurrent attempts never lose updates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::models::{NewUserAccount, SponsorPattern, UserAccount};
use super::repository::{RepositoryError, SponsorPatternRepository, UserRepository};

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn unavailable(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Unavailable(err.to_string())
}

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> UserAccount {
    UserAccount {
        id: row.get("id"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        salt: row.get("salt"),
        sponsor_id: row.get("sponsor_id"),
        linking_code: row.get("linking_code"),
        app_instance_id: row.get("app_instance_id"),
        created_at: row.get("created_at"),
        last_login_at: row.get("last_login_at"),
        failed_attempts: row.get("failed_attempts"),
        locked_until: row.get("locked_until"),
    }
}

const USER_COLUMNS: &str = "id, username, password_hash, salt, sponsor_id, linking_code, \
     app_instance_id, created_at, last_login_at, failed_attempts, locked_until";

pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn create_user(&self, user: NewUserAccount) -> Result<UserAccount, RepositoryError> {
        let query = format!(
            "INSERT INTO trial_users \
                 (username, password_hash, salt, sponsor_id, linking_code, app_instance_id) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(&user.salt)
            .bind(&user.sponsor_id)
            .bind(&user.linking_code)
            .bind(&user.app_instance_id)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", "INSERT INTO trial_users"))
            .await;

        match row {
            Ok(row) => Ok(user_from_row(&row)),
            Err(err) if is_unique_violation(&err) => Err(RepositoryError::Conflict),
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, RepositoryError> {
        let query = format!("SELECT {USER_COLUMNS} FROM trial_users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", "SELECT FROM trial_users WHERE id"))
            .await
            .map_err(unavailable)?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn get_user_by_username(
        &self,
        username: &str,
        sponsor_id: &str,
    ) -> Result<Option<UserAccount>, RepositoryError> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM trial_users WHERE username = $1 AND sponsor_id = $2"
        );
        let row = sqlx::query(&query)
            .bind(username)
            .bind(sponsor_id)
            .fetch_optional(&self.pool)
            .instrument(query_span(
                "SELECT",
                "SELECT FROM trial_users WHERE username, sponsor_id",
            ))
            .await
            .map_err(unavailable)?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn update_user(&self, user: &UserAccount) -> Result<(), RepositoryError> {
        let query = "UPDATE trial_users SET \
                password_hash = $2, salt = $3, last_login_at = $4, \
                failed_attempts = $5, locked_until = $6 \
             WHERE id = $1";
        let result = sqlx::query(query)
            .bind(user.id)
            .bind(&user.password_hash)
            .bind(&user.salt)
            .bind(user.last_login_at)
            .bind(user.failed_attempts)
            .bind(user.locked_until)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", "UPDATE trial_users"))
            .await
            .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn increment_failed_attempts(&self, id: Uuid) -> Result<i32, RepositoryError> {
        let query = "UPDATE trial_users \
             SET failed_attempts = failed_attempts + 1 \
             WHERE id = $1 \
             RETURNING failed_attempts";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", "UPDATE trial_users failed_attempts"))
            .await
            .map_err(unavailable)?;

        row.map(|row| row.get("failed_attempts"))
            .ok_or(RepositoryError::NotFound)
    }

    async fn reset_failed_attempts(&self, id: Uuid) -> Result<(), RepositoryError> {
        let query = "UPDATE trial_users \
             SET failed_attempts = 0, locked_until = NULL \
             WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", "UPDATE trial_users reset attempts"))
            .await
            .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn lock_account(
        &self,
        id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        // The WHERE clause makes the transition exclusive: a concurrent
        // attempt against an already-locked account affects zero rows.
        let query = "UPDATE trial_users \
             SET locked_until = $2 \
             WHERE id = $1 AND (locked_until IS NULL OR locked_until <= NOW())";
        let result = sqlx::query(query)
            .bind(id)
            .bind(until)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", "UPDATE trial_users locked_until"))
            .await
            .map_err(unavailable)?;

        Ok(result.rows_affected() > 0)
    }
}

fn pattern_from_row(row: &sqlx::postgres::PgRow) -> SponsorPattern {
    SponsorPattern {
        pattern_prefix: row.get("pattern_prefix"),
        sponsor_id: row.get("sponsor_id"),
        sponsor_name: row.get("sponsor_name"),
        portal_url: row.get("portal_url"),
        firestore_project: row.get("firestore_project"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        decommissioned_at: row.get("decommissioned_at"),
    }
}

const PATTERN_COLUMNS: &str = "pattern_prefix, sponsor_id, sponsor_name, portal_url, \
     firestore_project, active, created_at, decommissioned_at";

pub struct PostgresSponsorPatternRepository {
    pool: PgPool,
}

impl PostgresSponsorPatternRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SponsorPatternRepository for PostgresSponsorPatternRepository {
    async fn get_all_active_patterns(&self) -> Result<Vec<SponsorPattern>, RepositoryError> {
        let query = format!(
            "SELECT {PATTERN_COLUMNS} FROM sponsor_patterns \
             WHERE active \
             ORDER BY LENGTH(pattern_prefix) DESC, pattern_prefix"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", "SELECT FROM sponsor_patterns"))
            .await
            .map_err(unavailable)?;
        Ok(rows.iter().map(pattern_from_row).collect())
    }

    async fn find_by_linking_code(
        &self,
        normalized_code: &str,
    ) -> Result<Option<SponsorPattern>, RepositoryError> {
        // Prefix comparison happens on the normalized form of the stored
        // prefix so `CALL-` and `CALL` behave identically.
        let query = format!(
            "SELECT {PATTERN_COLUMNS} FROM sponsor_patterns \
             WHERE active \
               AND $1 LIKE UPPER(REGEXP_REPLACE(pattern_prefix, '[^A-Za-z0-9]', '', 'g')) || '%' \
             ORDER BY LENGTH(pattern_prefix) DESC, pattern_prefix \
             LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(normalized_code)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", "SELECT FROM sponsor_patterns prefix"))
            .await
            .map_err(unavailable)?;
        Ok(row.as_ref().map(pattern_from_row))
    }

    async fn create_pattern(&self, pattern: SponsorPattern) -> Result<(), RepositoryError> {
        let query = "INSERT INTO sponsor_patterns \
                 (pattern_prefix, sponsor_id, sponsor_name, portal_url, firestore_project, \
                  active, created_at, decommissioned_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";
        let result = sqlx::query(query)
            .bind(&pattern.pattern_prefix)
            .bind(&pattern.sponsor_id)
            .bind(&pattern.sponsor_name)
            .bind(&pattern.portal_url)
            .bind(&pattern.firestore_project)
            .bind(pattern.active)
            .bind(pattern.created_at)
            .bind(pattern.decommissioned_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", "INSERT INTO sponsor_patterns"))
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RepositoryError::Conflict),
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn decommission_pattern(&self, sponsor_id: &str) -> Result<(), RepositoryError> {
        let query = "UPDATE sponsor_patterns \
             SET active = FALSE, decommissioned_at = NOW() \
             WHERE sponsor_id = $1 AND active";
        let result = sqlx::query(query)
            .bind(sponsor_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", "UPDATE sponsor_patterns decommission"))
            .await
            .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
