/*
[INPUT]:  API key material from the embedding application
[OUTPUT]: Credentials resolved per login attempt
[POS]:    Auth layer - credentials provider seam
[UPDATE]: When adding credential sources
*/

use async_trait::async_trait;

use crate::error::{Result, StreamError};

/// API key, secret and optional passphrase
#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Check that key and secret are non-empty
    pub fn is_valid(&self) -> bool {
        !self.key.is_empty() && !self.secret.is_empty()
    }
}

/// Resolves credentials each time a login is attempted
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<Credentials>;
}

/// Fixed credentials
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        if !self.0.is_valid() {
            return Err(StreamError::Config("API key and secret must be set".to_string()));
        }
        Ok(self.0.clone())
    }
}
