//! Argon2id password hashing and verification.
//!
//! Hashes and salts cross this boundary base64-encoded; internally everything
//! operates on raw bytes. Comparison against the stored hash is constant-time.

use anyhow::{Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64ct::{Base64, Encoding};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Salt length in bytes. Fixed; a fresh salt is generated per account and
/// never reused.
pub const SALT_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum PasswordError {
    /// Stored hash or salt is not valid base64, or has the wrong length.
    #[error("malformed password material")]
    Format,
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
    #[error("argon2 hashing failed: {0}")]
    Hash(String),
}

/// Argon2id cost parameters. The defaults follow the OWASP profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    /// Output hash length in bytes.
    pub hash_length: usize,
}

impl Default for PasswordParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
            hash_length: 32,
        }
    }
}

impl PasswordParams {
    fn to_argon2(self) -> Result<Argon2<'static>, PasswordError> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(self.hash_length),
        )
        .map_err(|err| PasswordError::Params(err.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Generate a base64-encoded salt from the OS CSPRNG.
///
/// # Errors
///
/// Returns an error if the system random source fails.
pub fn generate_salt() -> Result<String> {
    let mut bytes = [0u8; SALT_LENGTH];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate salt")?;
    Ok(Base64::encode_string(&bytes))
}

/// Hash a password with Argon2id and return the base64-encoded digest.
///
/// # Errors
///
/// Returns [`PasswordError::Format`] when the salt is not valid base64 and
/// [`PasswordError::Params`]/[`PasswordError::Hash`] on Argon2 failures.
pub fn hash_password(
    password: &str,
    salt_b64: &str,
    params: &PasswordParams,
) -> Result<String, PasswordError> {
    let salt = Base64::decode_vec(salt_b64).map_err(|_| PasswordError::Format)?;
    let argon2 = params.to_argon2()?;

    let mut output = vec![0u8; params.hash_length];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut output)
        .map_err(|err| PasswordError::Hash(err.to_string()))?;

    Ok(Base64::encode_string(&output))
}

/// Verify a password against a stored base64 Argon2id hash.
///
/// A wrong password is `Ok(false)`; only malformed stored material or an
/// Argon2 failure is an error. The digest comparison is constant-time.
///
/// # Errors
///
/// Returns [`PasswordError::Format`] when the stored hash or salt cannot be
/// decoded or the hash length does not match `params.hash_length`.
pub fn verify_password(
    password: &str,
    salt_b64: &str,
    stored_hash_b64: &str,
    params: &PasswordParams,
) -> Result<bool, PasswordError> {
    let stored = Base64::decode_vec(stored_hash_b64).map_err(|_| PasswordError::Format)?;
    if stored.len() != params.hash_length {
        return Err(PasswordError::Format);
    }

    let salt = Base64::decode_vec(salt_b64).map_err(|_| PasswordError::Format)?;
    let argon2 = params.to_argon2()?;

    let mut computed = vec![0u8; params.hash_length];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut computed)
        .map_err(|err| PasswordError::Hash(err.to_string()))?;

    Ok(bool::from(computed.ct_eq(&stored)))
}

/// Check that client-supplied hash and salt decode to the expected lengths.
/// Used at registration before anything is persisted.
pub fn validate_material(
    hash_b64: &str,
    salt_b64: &str,
    params: &PasswordParams,
) -> Result<(), PasswordError> {
    let hash = Base64::decode_vec(hash_b64).map_err(|_| PasswordError::Format)?;
    if hash.len() != params.hash_length {
        return Err(PasswordError::Format);
    }
    let salt = Base64::decode_vec(salt_b64).map_err(|_| PasswordError::Format)?;
    if salt.len() != SALT_LENGTH {
        return Err(PasswordError::Format);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small parameters keep the tests fast; production uses the OWASP defaults.
    fn test_params() -> PasswordParams {
        PasswordParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }
    }

    #[test]
    fn default_params_follow_owasp_profile() {
        let params = PasswordParams::default();
        assert_eq!(params.memory_kib, 65536);
        assert_eq!(params.iterations, 3);
        assert_eq!(params.parallelism, 4);
        assert_eq!(params.hash_length, 32);
    }

    #[test]
    fn salt_is_fresh_and_fixed_length() -> Result<()> {
        let first = generate_salt()?;
        let second = generate_salt()?;
        assert_ne!(first, second);
        assert_eq!(Base64::decode_vec(&first).map(|b| b.len()), Ok(SALT_LENGTH));
        Ok(())
    }

    #[test]
    fn hash_then_verify_round_trips() -> Result<(), PasswordError> {
        let params = test_params();
        let salt = Base64::encode_string(&[7u8; SALT_LENGTH]);
        let hash = hash_password("correct horse", &salt, &params)?;

        assert!(verify_password("correct horse", &salt, &hash, &params)?);
        assert!(!verify_password("wrong horse", &salt, &hash, &params)?);
        Ok(())
    }

    #[test]
    fn same_password_different_salt_differs() -> Result<(), PasswordError> {
        let params = test_params();
        let salt_a = Base64::encode_string(&[1u8; SALT_LENGTH]);
        let salt_b = Base64::encode_string(&[2u8; SALT_LENGTH]);
        let hash_a = hash_password("secret", &salt_a, &params)?;
        let hash_b = hash_password("secret", &salt_b, &params)?;
        assert_ne!(hash_a, hash_b);
        Ok(())
    }

    #[test]
    fn malformed_material_is_a_format_error() {
        let params = test_params();
        let salt = Base64::encode_string(&[0u8; SALT_LENGTH]);

        let result = verify_password("pw", "not-base64!", "also-bad", &params);
        assert!(matches!(result, Err(PasswordError::Format)));

        // Valid base64 but wrong digest length.
        let short = Base64::encode_string(&[0u8; 4]);
        let result = verify_password("pw", &salt, &short, &params);
        assert!(matches!(result, Err(PasswordError::Format)));

        let result = hash_password("pw", "%%%", &params);
        assert!(matches!(result, Err(PasswordError::Format)));
    }

    #[test]
    fn validate_material_checks_lengths() {
        let params = test_params();
        let good_hash = Base64::encode_string(&[9u8; 32]);
        let good_salt = Base64::encode_string(&[9u8; SALT_LENGTH]);
        assert!(validate_material(&good_hash, &good_salt, &params).is_ok());

        let short_salt = Base64::encode_string(&[9u8; 8]);
        assert!(matches!(
            validate_material(&good_hash, &short_salt, &params),
            Err(PasswordError::Format)
        ));
        assert!(matches!(
            validate_material("***", &good_salt, &params),
            Err(PasswordError::Format)
        ));
    }
}
