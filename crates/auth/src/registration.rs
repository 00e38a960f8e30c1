//! User registration pipeline.
//!
//! Shape check → format checks → uniqueness probes → code verification →
//! id allocation → KDF → insert. The early uniqueness probes only make
//! errors friendly; the UNIQUE constraints on the insert are what actually
//! guarantee it, and a duplicate-key error is mapped back onto the losing
//! field so racing registrations resolve deterministically.

use std::sync::Arc;

use tracing::{error, info, warn};

use {
    roost_config::SharedConfig,
    roost_storage::{DuplicateField, NewUser, StorageError, UserIdGenerator, UserStore, classify_duplicate},
};

use crate::{
    codes::{CodeType, VerificationCodeManager, VerifyOutcome},
    password::hash_password,
};

/// The closed set of registration outcomes clients can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    InvalidInput,
    UsernameExists,
    EmailExists,
    InvalidVerificationCode,
    DatabaseError,
    UserIdGenerationFailed,
    PasswordTooWeak,
    EmailFormatInvalid,
    UsernameFormatInvalid,
}

impl RegisterError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput => "InvalidInput",
            Self::UsernameExists => "UsernameExists",
            Self::EmailExists => "EmailExists",
            Self::InvalidVerificationCode => "InvalidVerificationCode",
            Self::DatabaseError => "DatabaseError",
            Self::UserIdGenerationFailed => "UserIdGenerationFailed",
            Self::PasswordTooWeak => "PasswordTooWeak",
            Self::EmailFormatInvalid => "EmailFormatInvalid",
            Self::UsernameFormatInvalid => "UsernameFormatInvalid",
        }
    }

    /// Display-safe description.
    pub fn message(&self) -> &'static str {
        match self {
            Self::InvalidInput => "Required fields are missing",
            Self::UsernameExists => "Username is already taken",
            Self::EmailExists => "Email is already registered",
            Self::InvalidVerificationCode => "Verification code is invalid or expired",
            Self::DatabaseError => "Registration is temporarily unavailable",
            Self::UserIdGenerationFailed => "Could not allocate a user id",
            Self::PasswordTooWeak => "Password does not meet the minimum requirements",
            Self::EmailFormatInvalid => "Email address is not valid",
            Self::UsernameFormatInvalid => "Username must be 3-20 letters, digits or underscores",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub verification_code: String,
}

#[derive(Debug, Clone)]
pub struct RegisteredUser {
    pub user_id: String,
    pub user_data: serde_json::Value,
}

// ── Format validation ───────────────────────────────────────────────────────

/// 3–20 characters from `[A-Za-z0-9_]`.
pub fn validate_username(username: &str) -> bool {
    (3..=20).contains(&username.len())
        && username
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Pragmatic email shape check: one `@`, non-empty local part, dotted domain,
/// no whitespace, bounded length.
pub fn validate_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// Minimum length plus at least one letter and one digit.
pub fn validate_password(password: &str, min_length: usize) -> bool {
    password.len() >= min_length
        && password.chars().any(|c| c.is_ascii_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
}

// ── Service ─────────────────────────────────────────────────────────────────

pub struct RegistrationService {
    users: UserStore,
    codes: Arc<VerificationCodeManager>,
    ids: Arc<UserIdGenerator>,
    config: SharedConfig,
}

impl RegistrationService {
    pub fn new(
        users: UserStore,
        codes: Arc<VerificationCodeManager>,
        ids: Arc<UserIdGenerator>,
        config: SharedConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            users,
            codes,
            ids,
            config,
        })
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisteredUser, RegisterError> {
        // 1. Shape.
        if req.username.is_empty()
            || req.email.is_empty()
            || req.password.is_empty()
            || req.verification_code.is_empty()
        {
            return Err(RegisterError::InvalidInput);
        }

        // 2. Formats.
        if !validate_username(&req.username) {
            return Err(RegisterError::UsernameFormatInvalid);
        }
        if !validate_email(&req.email) {
            return Err(RegisterError::EmailFormatInvalid);
        }
        let min_length = self.config.get().security.password_min_length;
        if !validate_password(&req.password, min_length) {
            return Err(RegisterError::PasswordTooWeak);
        }

        // 3. Friendly early uniqueness probes.
        if self
            .users
            .username_exists(&req.username)
            .await
            .map_err(db_error)?
        {
            return Err(RegisterError::UsernameExists);
        }
        if self.users.email_exists(&req.email).await.map_err(db_error)? {
            return Err(RegisterError::EmailExists);
        }

        // 4. Verification code.
        match self
            .codes
            .verify(&req.email, &req.verification_code, CodeType::Registration)
            .await
        {
            Ok(VerifyOutcome::Success) => {},
            Ok(_) => return Err(RegisterError::InvalidVerificationCode),
            Err(e) => {
                error!(error = %e, "code verification backend failure");
                return Err(RegisterError::DatabaseError);
            },
        }

        // 5. Allocate the id.
        let user_id = match self.ids.next_id().await {
            Ok(id) => id,
            Err(StorageError::SequenceExhausted) => {
                error!("registration refused, id sequence exhausted");
                return Err(RegisterError::UserIdGenerationFailed);
            },
            Err(e) => {
                error!(error = %e, "user id allocation failed");
                return Err(RegisterError::UserIdGenerationFailed);
            },
        };

        // 6. KDF.
        let hashed = hash_password(&req.password).map_err(|e| {
            error!(error = %e, "password hashing failed");
            RegisterError::DatabaseError
        })?;

        // 7. Insert; the UNIQUE constraints decide races.
        let new_user = NewUser {
            user_id: user_id.clone(),
            username: req.username.clone(),
            email: req.email.clone(),
            password_hash: hashed.hash,
            salt: hashed.salt,
        };
        match self.users.insert_user(&new_user).await {
            Ok(()) => {},
            Err(StorageError::UniqueViolation { constraint }) => {
                warn!(username = %req.username, "lost registration race");
                return Err(match classify_duplicate(&constraint) {
                    DuplicateField::Username => RegisterError::UsernameExists,
                    DuplicateField::Email => RegisterError::EmailExists,
                    DuplicateField::Other => RegisterError::DatabaseError,
                });
            },
            Err(e) => {
                error!(error = %e, "user insert failed");
                return Err(RegisterError::DatabaseError);
            },
        }

        info!(user_id = %user_id, username = %req.username, "user registered");
        let user_data = serde_json::json!({
            "user_id": user_id,
            "username": req.username,
            "email": req.email,
            "display_name": serde_json::Value::Null,
            "status": "active",
            "email_verified": true,
        });
        Ok(RegisteredUser { user_id, user_data })
    }
}

fn db_error(e: StorageError) -> RegisterError {
    error!(error = %e, "storage failure during registration");
    RegisterError::DatabaseError
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(validate_username("alice"));
        assert!(validate_username("a_b_3"));
        assert!(validate_username("abc"));
        assert!(validate_username(&"x".repeat(20)));
        assert!(!validate_username("ab"));
        assert!(!validate_username(&"x".repeat(21)));
        assert!(!validate_username("has space"));
        assert!(!validate_username("tü"));
        assert!(!validate_username("semi;colon"));
    }

    #[test]
    fn email_rules() {
        assert!(validate_email("a@b.com"));
        assert!(validate_email("user.name+tag@sub.example.org"));
        assert!(!validate_email("no-at-sign"));
        assert!(!validate_email("@missing.local"));
        assert!(!validate_email("user@nodot"));
        assert!(!validate_email("user@.leadingdot"));
        assert!(!validate_email("user@trailing."));
        assert!(!validate_email("sp ace@b.com"));
    }

    #[test]
    fn password_rules() {
        assert!(validate_password("Passw0rd!", 6));
        assert!(validate_password("abc123", 6));
        assert!(!validate_password("abc12", 6));
        assert!(!validate_password("alll-letters", 6));
        assert!(!validate_password("123456789", 6));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(RegisterError::UsernameExists.code(), "UsernameExists");
        assert_eq!(RegisterError::EmailExists.code(), "EmailExists");
        assert_eq!(
            RegisterError::InvalidVerificationCode.code(),
            "InvalidVerificationCode"
        );
        assert_eq!(RegisterError::PasswordTooWeak.code(), "PasswordTooWeak");
    }
}
