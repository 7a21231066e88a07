use crate::protocol::PendingTransfer;
use serde::Serialize;
use tokio::sync::broadcast;

/// Progress snapshot for an in-flight transfer.
///
/// `bytes_transferred` is cumulative for the current attempt. After a retry
/// the counter restarts at the last per-file acknowledgment boundary; the
/// preceding `TransferRetry` event is the explicit reset signal.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub current_file: Option<String>,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
}

/// Events emitted by the engine, in emission order.
///
/// Consumers must handle every variant; per-transfer ordering is guaranteed
/// (no event for an id follows its terminal event).
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// Server is accepting inbound offers on `port`
    ServerStarted { port: u16 },
    /// Server rebound; only new inbound offers are affected
    PortChanged { new_port: u16 },
    /// A new inbound offer awaits accept/reject
    TransferRequest { transfer: PendingTransfer },
    /// Progress update for an in-flight transfer
    TransferProgress { progress: TransferProgress },
    /// A transient failure will be retried after the configured delay.
    /// Also signals that progress counters for the id are about to reset.
    TransferRetry {
        #[serde(rename = "transferId")]
        transfer_id: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    /// Terminal: all bytes of all files acknowledged
    TransferComplete {
        #[serde(rename = "transferId")]
        transfer_id: String,
    },
    /// Terminal: unrecoverable error or retries exhausted
    TransferFailed {
        #[serde(rename = "transferId")]
        transfer_id: String,
        error: String,
    },
    /// Terminal: cancelled by explicit request
    TransferCancelled {
        #[serde(rename = "transferId")]
        transfer_id: String,
    },
    /// Out-of-band failure not tied to a specific transfer (store I/O etc.)
    EngineError { error: String },
}

/// Ordered, multi-consumer stream of engine events.
///
/// Built on a broadcast channel: every subscriber observes events in emission
/// order. Slow subscribers that lag past the buffer lose the oldest events,
/// never see them reordered.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Silently drops when no subscriber is attached.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!("event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_emission_order() {
        let bus = EventBus::new(16);
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(EngineEvent::ServerStarted { port: 53317 });
        bus.publish(EngineEvent::PortChanged { new_port: 9000 });

        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                EngineEvent::ServerStarted { port: 53317 }
            ));
            assert!(matches!(
                rx.recv().await.unwrap(),
                EngineEvent::PortChanged { new_port: 9000 }
            ));
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::EngineError {
            error: "store write failed".to_string(),
        });
    }

    #[test]
    fn test_event_serialization_tags() {
        let json = serde_json::to_value(EngineEvent::TransferComplete {
            transfer_id: "t-1".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "transferComplete");
        assert_eq!(json["transferId"], "t-1");
    }
}
