use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::Rng;

use super::AuthError;

const TEMP_PASSWORD_LEN: usize = 12;
const TEMP_PASSWORD_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Hash a password into a PHC string (argon2id).
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hash(err.to_string()))
}

/// Compare a plaintext password against a stored PHC string. A mismatch is
/// `Ok(false)`; only malformed hashes are errors.
pub fn check_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|err| AuthError::Hash(err.to_string()))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(AuthError::Hash(err.to_string())),
    }
}

/// Random 12-char alphanumeric, for `add` and `reset`.
pub fn generate_temporary_password() -> String {
    let mut rng = rand::thread_rng();
    (0..TEMP_PASSWORD_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..TEMP_PASSWORD_CHARS.len());
            TEMP_PASSWORD_CHARS[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_check_round_trips() {
        let hash = hash_password("hunter2hunter2").unwrap();
        assert!(check_password("hunter2hunter2", &hash).unwrap());
        assert!(!check_password("wrong", &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(check_password("x", "not-a-phc-string").is_err());
    }

    #[test]
    fn temp_passwords_are_alphanumeric() {
        let pwd = generate_temporary_password();
        assert_eq!(pwd.len(), 12);
        assert!(pwd.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pwd, generate_temporary_password());
    }
}
