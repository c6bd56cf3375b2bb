//! Account credentials for the Kumo cloud.
//!
//! The password is held in a [`SecretString`] so it never appears in logs or
//! `Debug` output. It is only exposed when a login request body is built.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Username and password for a Kumo cloud account.
///
/// # Example
///
/// ```
/// use kumo_core::Credentials;
///
/// let creds = Credentials::new("user@example.com", "password123");
/// assert_eq!(creds.username, "user@example.com");
/// assert_eq!(creds.expose_password(), "password123");
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// Account username (an email address).
    pub username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Returns `true` if either the username or the password is empty.
    ///
    /// The cloud always rejects such a pair, so callers can fail early.
    pub fn is_incomplete(&self) -> bool {
        self.username.is_empty() || self.password.expose_secret().is_empty()
    }

    /// Exposes the password. Never log the returned value.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_new() {
        let creds = Credentials::new("user@example.com", "password123");
        assert_eq!(creds.username, "user@example.com");
        assert_eq!(creds.expose_password(), "password123");
        assert!(!creds.is_incomplete());
    }

    #[test]
    fn test_credentials_incomplete() {
        assert!(Credentials::new("", "pass").is_incomplete());
        assert!(Credentials::new("user", "").is_incomplete());
    }

    #[test]
    fn test_credentials_equality() {
        assert_eq!(Credentials::new("u", "p"), Credentials::new("u", "p"));
        assert_ne!(Credentials::new("u", "p"), Credentials::new("u", "q"));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("user@example.com", "secret123");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("user@example.com"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret123"));
    }
}
