/*
[INPUT]:  API secret, timestamp, HTTP verb, login path
[OUTPUT]: Keyed-hash login signature (base64 or hex)
[POS]:    Auth layer - cryptographic signing for the login handshake
[UPDATE]: When changing signing algorithm or prehash layout
*/

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, StreamError};
use crate::types::SignatureEncoding;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer for the websocket login
pub struct LoginSigner {
    secret: Vec<u8>,
    encoding: SignatureEncoding,
}

impl std::fmt::Debug for LoginSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginSigner")
            .field("secret", &"<redacted>")
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl LoginSigner {
    pub fn new(secret: &str, encoding: SignatureEncoding) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            encoding,
        }
    }

    /// `timestamp + method + path`
    pub fn prehash(timestamp: &str, method: &str, path: &str) -> String {
        format!("{timestamp}{}{path}", method.to_ascii_uppercase())
    }

    pub fn sign(&self, message: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StreamError::Config(format!("HMAC setup failed: {e}")))?;
        mac.update(message.as_bytes());
        let digest = mac.finalize().into_bytes();

        Ok(match self.encoding {
            SignatureEncoding::Base64 => BASE64.encode(digest),
            SignatureEncoding::Hex => hex::encode(digest),
        })
    }

    pub fn sign_login(&self, timestamp: &str, method: &str, path: &str) -> Result<String> {
        self.sign(&Self::prehash(timestamp, method, path))
    }
}
