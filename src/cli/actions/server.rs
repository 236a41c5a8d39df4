use crate::api;
use crate::auth::{token::TokenConfig, AuthConfig};
use crate::cli::{actions::Action, globals::GlobalArgs};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use secrecy::SecretString;
use std::time::Duration;
use url::Url;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            signing_key,
            issuer,
            rate_limit_max,
            rate_limit_window_seconds,
            max_failed_attempts,
            lockout_duration_minutes,
        } => {
            let dsn = Url::parse(&dsn)
                .context("Invalid database connection string")?
                .to_string();

            // Fail closed: no signing key, no server.
            let pem = tokio::fs::read_to_string(&signing_key)
                .await
                .with_context(|| format!("Failed to read signing key from {signing_key}"))?;
            let globals = GlobalArgs::new(SecretString::from(pem), issuer.clone());

            let token_config = TokenConfig::default().with_issuer(issuer);
            let auth_config = AuthConfig::default()
                .with_max_failed_attempts(i32::try_from(max_failed_attempts).unwrap_or(5))
                .with_lockout_duration(ChronoDuration::minutes(
                    i64::try_from(lockout_duration_minutes).unwrap_or(15),
                ))
                .with_rate_limit(
                    rate_limit_max,
                    Duration::from_secs(rate_limit_window_seconds),
                );

            api::new(port, dsn, &globals, token_config, auth_config).await?;
        }
    }

    Ok(())
}
