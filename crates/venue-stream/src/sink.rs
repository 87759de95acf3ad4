/*
[INPUT]:  Decoded events from handlers, dispatcher and supervisor
[OUTPUT]: Events delivered to the downstream consumer channel
[POS]:    Output layer - data handler surface
[UPDATE]: When changing delivery semantics for downstream consumers
*/

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StreamError;
use crate::types::DataEvent;

/// Cloneable handle publishing [`DataEvent`]s to the consumer.
///
/// Publishing waits for capacity, so a slow consumer applies
/// backpressure to the dispatcher instead of losing events.
#[derive(Debug, Clone)]
pub struct DataSink {
    tx: mpsc::Sender<DataEvent>,
}

impl DataSink {
    /// Create a sink and the receiver the consumer drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DataEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::Sender<DataEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the consumer has gone away
    pub async fn publish(&self, event: DataEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(err) => {
                debug!(event = ?err.0, "data sink closed, dropping event");
                false
            }
        }
    }

    pub async fn publish_error(&self, error: StreamError) -> bool {
        self.publish(DataEvent::Error(error)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
