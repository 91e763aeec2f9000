use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::Rng;
use typerace_types::api::normalize_name;
use typerace_types::LobbyError;

/// Shortest password accepted at registration.
pub const MIN_PASSWORD_LEN: usize = 4;

fn salt() -> Result<SaltString, argon2::password_hash::Error> {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    SaltString::encode_b64(&bytes)
}

/// Hashes a password into a PHC string.
pub fn hash(password: &str) -> Result<String, argon2::password_hash::Error> {
    Argon2::default()
        .hash_password(password.as_bytes(), &salt()?)
        .map(|hash| hash.to_string())
}

pub fn verify(password: &str, hashword: &str) -> bool {
    PasswordHash::new(hashword)
        .ok()
        .as_ref()
        .map(|hash| {
            Argon2::default()
                .verify_password(password.as_bytes(), hash)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Validates registration input and returns the normalized username.
pub fn validate_registration(username: &str, password: &str) -> Result<String, LobbyError> {
    let username = normalize_name("username", username)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(LobbyError::invalid(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(username)
}
