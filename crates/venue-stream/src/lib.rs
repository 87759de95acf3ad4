/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public venue streaming crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod auth;
pub mod config;
pub mod connector;
pub mod error;
pub mod orderbook;
pub mod ratelimit;
pub mod sink;
pub mod subscription;
pub mod types;
pub mod ws;

// Re-export commonly used types from auth
pub use auth::{AuthSession, Authenticator, Credentials, CredentialsProvider, LoginSigner, StaticCredentials};

pub use config::{AuthConfig, PingMode, ReconnectConfig, StreamConfig};
pub use connector::{ConnectionState, StreamConnector};
pub use error::{Result, StreamError};

pub use orderbook::{BookDelta, OrderBookTable, OrderBookView, compute_checksum};
pub use ratelimit::{RateLimiter, Unlimited};
pub use sink::DataSink;
pub use subscription::{DefaultChannels, Subscription, SubscriptionManager, batch_requests};

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    ChannelHandler, Envelope, FrameSender, HandlerContext, HandlerRegistry, Multiplexer, RequestCriteria,
};
