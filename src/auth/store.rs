use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

use super::password::{check_password, hash_password};
use super::{AuthError, UserInfo, UserStore};

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    users: Vec<UserRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    username: String,
    password_hash: String,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    force_change: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_login: Option<DateTime<Utc>>,
}

/// JSON-file-backed store. An in-process `RwLock` serializes access between
/// hub sessions; an advisory `flock` on a sibling `.lock` file covers the
/// admin CLI mutating the same file from another process.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: RwLock<()>,
}

impl FileStore {
    /// Open (creating if necessary) the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self, AuthError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("users.json");
        let store = Self {
            lock_path: path.with_extension("json.lock"),
            path,
            guard: RwLock::new(()),
        };
        if !store.path.exists() {
            store.write(&UsersFile::default())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<UsersFile, AuthError> {
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Atomic write via temp file + rename.
    fn write(&self, data: &UsersFile) -> Result<(), AuthError> {
        let raw = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Run `f` under the exclusive cross-process lock.
    fn with_file_lock<T>(&self, f: impl FnOnce() -> Result<T, AuthError>) -> Result<T, AuthError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        let _flock: Flock<File> = Flock::lock(lock_file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| AuthError::Lock(errno.to_string()))?;
        f()
    }

    fn modify_user(
        &self,
        username: &str,
        f: impl FnOnce(&mut UserRecord) -> Result<(), AuthError>,
    ) -> Result<(), AuthError> {
        let _guard = self.guard.write().unwrap();
        self.with_file_lock(|| {
            let mut data = self.read()?;
            let record = data
                .users
                .iter_mut()
                .find(|u| u.username == username)
                .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;
            f(record)?;
            self.write(&data)
        })
    }
}

impl UserStore for FileStore {
    fn authenticate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        let _guard = self.guard.read().unwrap();
        let data = self.read()?;
        match data.users.iter().find(|u| u.username == username) {
            Some(user) if !user.locked => check_password(password, &user.password_hash),
            Some(_) => {
                warn!(user = %username, "login attempt against locked account");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn must_change_password(&self, username: &str) -> Result<bool, AuthError> {
        let _guard = self.guard.read().unwrap();
        let data = self.read()?;
        data.users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.force_change)
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))
    }

    fn set_password(&self, username: &str, new_password: &str) -> Result<(), AuthError> {
        let hash = hash_password(new_password)?;
        self.modify_user(username, |u| {
            u.password_hash = hash;
            u.force_change = false;
            Ok(())
        })
    }

    fn update_last_login(&self, username: &str) -> Result<(), AuthError> {
        self.modify_user(username, |u| {
            u.last_login = Some(Utc::now());
            Ok(())
        })
    }

    fn add(&self, username: &str, temp_password: &str) -> Result<(), AuthError> {
        let hash = hash_password(temp_password)?;
        let _guard = self.guard.write().unwrap();
        self.with_file_lock(|| {
            let mut data = self.read()?;
            if data.users.iter().any(|u| u.username == username) {
                return Err(AuthError::UserExists(username.to_string()));
            }
            data.users.push(UserRecord {
                username: username.to_string(),
                password_hash: hash,
                locked: false,
                force_change: true,
                last_login: None,
            });
            self.write(&data)
        })
    }

    fn remove(&self, username: &str) -> Result<(), AuthError> {
        let _guard = self.guard.write().unwrap();
        self.with_file_lock(|| {
            let mut data = self.read()?;
            let before = data.users.len();
            data.users.retain(|u| u.username != username);
            if data.users.len() == before {
                return Err(AuthError::UnknownUser(username.to_string()));
            }
            self.write(&data)
        })
    }

    fn list(&self) -> Result<Vec<UserInfo>, AuthError> {
        let _guard = self.guard.read().unwrap();
        let data = self.read()?;
        Ok(data
            .users
            .iter()
            .map(|u| UserInfo {
                username: u.username.clone(),
                locked: u.locked,
                last_login: u.last_login,
                force_change: u.force_change,
            })
            .collect())
    }

    fn lock(&self, username: &str) -> Result<(), AuthError> {
        self.modify_user(username, |u| {
            u.locked = true;
            Ok(())
        })
    }

    fn unlock(&self, username: &str) -> Result<(), AuthError> {
        self.modify_user(username, |u| {
            u.locked = false;
            Ok(())
        })
    }

    fn reset(&self, username: &str, new_password: &str) -> Result<(), AuthError> {
        let hash = hash_password(new_password)?;
        self.modify_user(username, |u| {
            u.password_hash = hash;
            u.force_change = true;
            Ok(())
        })
    }
}
