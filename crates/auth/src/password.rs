//! Argon2id password hashing.
//!
//! The PHC string embeds the salt and parameters; the generated salt is also
//! returned separately because the user row keeps a `salt` column. Default
//! Argon2id parameters land comfortably past the 100 ms stretch target on
//! current hardware.

use {
    argon2::{
        Argon2,
        password_hash::{
            PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
        },
    },
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("failed to hash password: {0}")]
    Hash(String),
}

/// A freshly derived credential pair.
#[derive(Debug, Clone)]
pub struct HashedPassword {
    /// Full PHC string (`$argon2id$...`).
    pub hash: String,
    /// The salt, base64-encoded, as stored in the user row.
    pub salt: String,
}

pub fn hash_password(password: &str) -> Result<HashedPassword, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::Hash(e.to_string()))?;
    Ok(HashedPassword {
        hash: hash.to_string(),
        salt: salt.to_string(),
    })
}

pub fn verify_password(password: &str, hash_str: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash_str) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
