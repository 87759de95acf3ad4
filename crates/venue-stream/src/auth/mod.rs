/*
[INPUT]:  API credentials and auth configuration
[OUTPUT]: Signed login payloads and authenticated sessions
[POS]:    Auth layer - websocket login
[UPDATE]: When auth flow or signature methods change
*/

pub mod authenticator;
pub mod credentials;
pub mod signer;

pub use authenticator::{AuthSession, Authenticator};
pub use credentials::{Credentials, CredentialsProvider, StaticCredentials};
pub use signer::LoginSigner;
