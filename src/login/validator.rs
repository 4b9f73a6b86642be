//! Login validation plug points
//!
//! The server side asks a [`LoginValidator`] for challenge properties and
//! later for a verdict. The client side answers challenges through a
//! [`CredentialsProvider`]. Property contents are opaque to the messenger.

use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::protocol::Properties;

/// Server-side admission check
pub trait LoginValidator: Send + Sync {
    /// Properties sent to a client asking to log in as `candidate_name`
    fn challenge_properties(&self, candidate_name: &str, remote: SocketAddr) -> Properties;

    /// Judge the client's answer. `Some(reason)` rejects the login.
    fn verify(
        &self,
        sent: &Properties,
        received: &Properties,
        claimed_name: &str,
        mac_hash: &str,
        remote: SocketAddr,
    ) -> Option<String>;
}

/// Client-side challenge responder
pub trait CredentialsProvider: Send + Sync {
    fn respond(&self, challenge: &Properties) -> Properties;
}

/// Admits every client with an empty challenge
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl LoginValidator for AllowAll {
    fn challenge_properties(&self, _candidate_name: &str, _remote: SocketAddr) -> Properties {
        Properties::new()
    }

    fn verify(
        &self,
        _sent: &Properties,
        _received: &Properties,
        _claimed_name: &str,
        _mac_hash: &str,
        _remote: SocketAddr,
    ) -> Option<String> {
        None
    }
}

/// Answers every challenge with no properties
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialsProvider for NoCredentials {
    fn respond(&self, _challenge: &Properties) -> Properties {
        Properties::new()
    }
}

pub const SALT_PROPERTY: &str = "Salt";
pub const PASSWORD_PROPERTY: &str = "Password";
pub const PASSWORD_REQUIRED_PROPERTY: &str = "Password Required";

pub const INVALID_PASSWORD: &str = "Invalid password";

/// Hash a shared password with a one-time salt
pub fn salted_password_hash(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Shared-password game admission
pub struct PasswordValidator {
    password: String,
}

impl PasswordValidator {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl LoginValidator for PasswordValidator {
    fn challenge_properties(&self, _candidate_name: &str, _remote: SocketAddr) -> Properties {
        let mut properties = Properties::new();
        properties.insert(PASSWORD_REQUIRED_PROPERTY.to_string(), true.to_string());
        properties.insert(SALT_PROPERTY.to_string(), Uuid::new_v4().simple().to_string());
        properties
    }

    fn verify(
        &self,
        sent: &Properties,
        received: &Properties,
        claimed_name: &str,
        _mac_hash: &str,
        remote: SocketAddr,
    ) -> Option<String> {
        let Some(salt) = sent.get(SALT_PROPERTY) else {
            return Some("Challenge is missing its salt".to_string());
        };
        let expected = salted_password_hash(salt, &self.password);
        match received.get(PASSWORD_PROPERTY) {
            Some(answer) if constant_time_eq(answer.as_bytes(), expected.as_bytes()) => None,
            _ => {
                tracing::info!("Bad password from {} ({})", claimed_name, remote);
                Some(INVALID_PASSWORD.to_string())
            }
        }
    }
}

/// Byte comparison whose timing depends only on the lengths
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Answers a [`PasswordValidator`] challenge
pub struct PasswordCredentials {
    password: String,
}

impl PasswordCredentials {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl CredentialsProvider for PasswordCredentials {
    fn respond(&self, challenge: &Properties) -> Properties {
        let mut properties = Properties::new();
        if let Some(salt) = challenge.get(SALT_PROPERTY) {
            properties.insert(
                PASSWORD_PROPERTY.to_string(),
                salted_password_hash(salt, &self.password),
            );
        }
        properties
    }
}
