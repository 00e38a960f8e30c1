//! User rows and login audit log.
//!
//! Uniqueness of `username` and `email` is enforced by UNIQUE constraints;
//! duplicate-key errors are mapped onto the offending field here so callers
//! get a deterministic answer even under racing registrations.

use {
    serde::Serialize,
    sqlx::FromRow,
    tracing::warn,
};

use crate::{error::StorageError, pool::ConnectionPool};

/// Account lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Banned,
    Deleted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Banned => "banned",
            Self::Deleted => "deleted",
        }
    }

    /// Unknown values map to `Inactive` rather than failing the row.
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "banned" => Self::Banned,
            "deleted" => Self::Deleted,
            _ => Self::Inactive,
        }
    }
}

/// One row of `users`, minus timestamps.
#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    pub display_name: Option<String>,
    pub status: String,
    pub email_verified: bool,
}

impl UserRecord {
    pub fn status(&self) -> UserStatus {
        UserStatus::parse(&self.status)
    }

    /// Client-facing projection; never includes hash or salt.
    pub fn public_data(&self) -> serde_json::Value {
        serde_json::json!({
            "user_id": self.user_id,
            "username": self.username,
            "email": self.email,
            "display_name": self.display_name,
            "status": self.status,
            "email_verified": self.email_verified,
        })
    }
}

/// Fields required to create a user row.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
}

/// Which UNIQUE constraint a duplicate-key error hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateField {
    Username,
    Email,
    Other,
}

/// Map a MySQL duplicate-entry message onto the violated field. The message
/// names the key, e.g. `Duplicate entry 'alice' for key 'users.username'`.
pub fn classify_duplicate(constraint: &str) -> DuplicateField {
    if constraint.contains("username") {
        DuplicateField::Username
    } else if constraint.contains("email") {
        DuplicateField::Email
    } else {
        DuplicateField::Other
    }
}

const USER_COLUMNS: &str =
    "user_id, username, email, password_hash, salt, display_name, status, email_verified";

#[derive(Clone)]
pub struct UserStore {
    pool: ConnectionPool,
}

impl UserStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?");
        Ok(sqlx::query_as(&sql)
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?");
        Ok(sqlx::query_as(&sql)
            .bind(email)
            .fetch_optional(&mut *conn)
            .await?)
    }

    pub async fn find_by_user_id(
        &self,
        user_id: &str,
    ) -> Result<Option<UserRecord>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?");
        Ok(sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?)
    }

    pub async fn username_exists(&self, username: &str) -> Result<bool, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    pub async fn email_exists(&self, email: &str) -> Result<bool, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// Insert a fresh account row (`active`, email verified). A duplicate-key
    /// error surfaces as `StorageError::UniqueViolation`.
    pub async fn insert_user(&self, user: &NewUser) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO users
                 (user_id, username, email, password_hash, salt, status, email_verified, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'active', TRUE, NOW(), NOW())",
        )
        .bind(&user.user_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.salt)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn update_last_login(&self, user_id: &str) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE users SET last_login_at = NOW(), updated_at = NOW() WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Append a row to the login audit log. Failures are logged and swallowed;
    /// auditing never fails a login.
    pub async fn record_login(&self, user_id: &str, ip: &str, success: bool) {
        let result: Result<(), StorageError> = async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query(
                "INSERT INTO login_logs (user_id, ip_address, success, created_at)
                 VALUES (?, ?, ?, NOW())",
            )
            .bind(user_id)
            .bind(ip)
            .bind(success)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(user_id, error = %e, "failed to record login log");
        }
    }
}
