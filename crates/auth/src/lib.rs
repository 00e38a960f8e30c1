//! Authentication building blocks: password hashing, one-time verification
//! codes, the registration pipeline, and the mail-dispatch seam.

pub mod codes;
pub mod mailer;
pub mod password;
pub mod registration;

pub use {
    codes::{
        CodeError, CodeType, IssueError, IssuedCode, RateLimitScope, VerificationCodeManager,
        VerifyOutcome,
    },
    mailer::{LogMailer, Mailer},
    password::{HashedPassword, hash_password, verify_password},
    registration::{
        RegisterError, RegisterRequest, RegisteredUser, RegistrationService, validate_email,
        validate_password, validate_username,
    },
};
