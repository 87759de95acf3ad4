/*
[INPUT]:  Credentials provider, auth config, multiplexer, authenticated socket
[OUTPUT]: Authenticated session or a surfaced auth failure
[POS]:    Auth layer - login handshake
[UPDATE]: When the venue changes its login payload or reply format
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::credentials::CredentialsProvider;
use super::signer::LoginSigner;
use crate::config::AuthConfig;
use crate::error::{Result, StreamError};
use crate::ws::{FrameSender, Multiplexer, OutboundRequest, RequestCriteria};

/// Result of one successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub key: String,
    pub timestamp: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
struct LoginArg<'a> {
    #[serde(rename = "apiKey")]
    api_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    passphrase: Option<&'a str>,
    timestamp: &'a str,
    sign: &'a str,
}

/// Drives the login handshake through the multiplexer.
///
/// The authenticated flag is cleared at the start of every attempt and
/// set only by an explicit success reply.
pub struct Authenticator {
    provider: Arc<dyn CredentialsProvider>,
    config: AuthConfig,
    authenticated: AtomicBool,
}

impl Authenticator {
    pub fn new(provider: Arc<dyn CredentialsProvider>, config: AuthConfig) -> Self {
        Self {
            provider,
            config,
            authenticated: AtomicBool::new(false),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Drop the authenticated state (socket lost)
    pub fn reset(&self) {
        self.authenticated.store(false, Ordering::Release);
    }

    /// Build the signed login frame for `timestamp` (unix seconds)
    pub async fn login_request(&self, timestamp: &str) -> Result<(AuthSession, String)> {
        let credentials = self.provider.credentials().await?;
        let signer = LoginSigner::new(&credentials.secret, self.config.signature_encoding);
        let signature = signer.sign_login(timestamp, &self.config.login_method, &self.config.login_path)?;

        let payload = OutboundRequest::new(
            "login",
            [LoginArg {
                api_key: &credentials.key,
                passphrase: credentials.passphrase.as_deref(),
                timestamp,
                sign: &signature,
            }],
        )
        .to_text()?;

        let session = AuthSession {
            key: credentials.key.clone(),
            timestamp: timestamp.to_string(),
            signature,
        };
        Ok((session, payload))
    }

    /// Log in on `link`; waits for a `login` (or `error`) reply up to the configured timeout
    pub async fn login(&self, mux: &Multiplexer, link: &dyn FrameSender) -> Result<AuthSession> {
        self.reset();
        let timestamp = Utc::now().timestamp().to_string();
        let (session, payload) = self.login_request(&timestamp).await?;

        let criteria = RequestCriteria::event("login").or_event("error");
        let reply = match mux.request(link, None, criteria, payload, self.config.timeout()).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "ws login did not complete");
                return Err(err);
            }
        };

        let code = reply.code.clone().unwrap_or_default();
        let is_login = reply
            .event_name()
            .is_some_and(|event| event.eq_ignore_ascii_case("login"));
        if is_login && (code.is_empty() || code == "0") {
            self.authenticated.store(true, Ordering::Release);
            info!(key = %session.key, "ws login succeeded");
            return Ok(session);
        }

        let message = reply.msg.clone().unwrap_or_default();
        warn!(code = %code, message = %message, "ws login rejected");
        if self.config.error_codes.iter().any(|known| *known == code) || is_login {
            Err(StreamError::Authentication { code, message })
        } else {
            Err(StreamError::Api { code, message })
        }
    }
}
