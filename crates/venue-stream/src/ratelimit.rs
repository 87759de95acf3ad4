/*
[INPUT]:  Outbound frames about to hit the wire
[OUTPUT]: Permission to send (or a RateLimited error)
[POS]:    Transport support - rate limiter seam
[UPDATE]: When plugging in a venue-specific token bucket
*/

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ConnectionKind;

/// Consulted before every websocket send.
///
/// Implementations may wait for a token or fail fast with
/// [`StreamError::RateLimited`](crate::StreamError::RateLimited).
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self, kind: ConnectionKind) -> Result<()>;
}

/// Limiter that always allows the send
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn acquire(&self, _kind: ConnectionKind) -> Result<()> {
        Ok(())
    }
}
