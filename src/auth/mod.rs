//! Operator accounts: the narrow authenticator seam the server consults,
//! plus the file-backed store behind it.

mod password;
mod store;

pub use password::{check_password, generate_temporary_password, hash_password};
pub use store::FileStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user {0:?} already exists")]
    UserExists(String),
    #[error("user {0:?} not found")]
    UnknownUser(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("users file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("file lock failed: {0}")]
    Lock(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Public view of a user for listing.
#[derive(Clone, Debug)]
pub struct UserInfo {
    pub username: String,
    pub locked: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub force_change: bool,
}

/// User management operations. The server only touches the first four; the
/// admin CLI uses the rest.
pub trait UserStore: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> Result<bool, AuthError>;
    fn must_change_password(&self, username: &str) -> Result<bool, AuthError>;
    fn set_password(&self, username: &str, new_password: &str) -> Result<(), AuthError>;
    fn update_last_login(&self, username: &str) -> Result<(), AuthError>;

    fn add(&self, username: &str, temp_password: &str) -> Result<(), AuthError>;
    fn remove(&self, username: &str) -> Result<(), AuthError>;
    fn list(&self) -> Result<Vec<UserInfo>, AuthError>;
    fn lock(&self, username: &str) -> Result<(), AuthError>;
    fn unlock(&self, username: &str) -> Result<(), AuthError>;
    fn reset(&self, username: &str, new_password: &str) -> Result<(), AuthError>;
}
