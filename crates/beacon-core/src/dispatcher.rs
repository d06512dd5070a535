//! Broadcast fan-out.
//!
//! One cycle pushes one telemetry frame, holding every event of the batch,
//! to every connection in a registry snapshot. Pushes run as concurrent
//! tasks and the cycle returns only after all of them have settled. A push
//! that comes back gone deregisters its connection; any other failure is
//! logged and the connection is kept. Nothing is retried within a cycle.

use beacon_protocol::{codec, DecodedEvent};
use beacon_transport::{DeliveryError, PushSender};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectionRecord, ConnectionRegistry};

/// Outcome of a single push.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PushOutcome {
    Delivered,
    Pruned(String),
    Failed,
}

/// What happened in one broadcast cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Pushes attempted.
    pub attempted: usize,
    /// Pushes accepted by the transport.
    pub delivered: usize,
    /// Connections deregistered because their push came back gone.
    pub pruned: Vec<String>,
    /// Pushes that failed for any other reason.
    pub failed: usize,
    /// Size of the shared payload in bytes.
    pub payload_bytes: usize,
}

/// Fans decoded batches out to registered connections.
pub struct BroadcastDispatcher {
    registry: Arc<dyn ConnectionRegistry>,
    sender: Arc<dyn PushSender>,
}

impl BroadcastDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(registry: Arc<dyn ConnectionRegistry>, sender: Arc<dyn PushSender>) -> Self {
        Self { registry, sender }
    }

    /// Push `events` to every connection and wait for all pushes to settle.
    ///
    /// Does nothing when either `events` or `connections` is empty.
    pub async fn broadcast(
        &self,
        events: &[DecodedEvent],
        connections: &[ConnectionRecord],
    ) -> BroadcastReport {
        if events.is_empty() || connections.is_empty() {
            debug!(
                events = events.len(),
                connections = connections.len(),
                "Nothing to broadcast"
            );
            return BroadcastReport::default();
        }

        let payload = match codec::encode_telemetry(events) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode telemetry payload");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport {
            attempted: connections.len(),
            payload_bytes: payload.len(),
            ..BroadcastReport::default()
        };

        let mut pushes = JoinSet::new();
        for connection in connections {
            pushes.spawn(deliver(
                Arc::clone(&self.registry),
                Arc::clone(&self.sender),
                connection.connection_id.clone(),
                payload.clone(),
            ));
        }

        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok(PushOutcome::Delivered) => report.delivered += 1,
                Ok(PushOutcome::Pruned(id)) => report.pruned.push(id),
                Ok(PushOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "Push task aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            events = events.len(),
            attempted = report.attempted,
            delivered = report.delivered,
            pruned = report.pruned.len(),
            failed = report.failed,
            transport = self.sender.name(),
            "Broadcast cycle complete"
        );

        report
    }
}

async fn deliver(
    registry: Arc<dyn ConnectionRegistry>,
    sender: Arc<dyn PushSender>,
    connection_id: String,
    payload: Bytes,
) -> PushOutcome {
    match sender.push(&connection_id, payload).await {
        Ok(()) => PushOutcome::Delivered,
        Err(DeliveryError::Gone) => {
            debug!(connection = %connection_id, "Connection gone, deregistering");
            if let Err(e) = registry.deregister(&connection_id).await {
                warn!(connection = %connection_id, error = %e, "Failed to prune gone connection");
            }
            PushOutcome::Pruned(connection_id)
        }
        Err(DeliveryError::Other(reason)) => {
            warn!(connection = %connection_id, reason = %reason, "Push failed, keeping connection");
            PushOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every push and answers from a fixed script.
    #[derive(Default)]
    struct Recorder {
        pushes: Mutex<Vec<(String, Bytes)>>,
        outcomes: HashMap<String, DeliveryError>,
    }

    #[async_trait]
    impl PushSender for Recorder {
        async fn push(&self, connection_id: &str, payload: Bytes) -> Result<(), DeliveryError> {
            self.pushes
                .lock()
                .unwrap()
                .push((connection_id.to_string(), payload));
            match self.outcomes.get(connection_id) {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    fn event(offset: i64) -> DecodedEvent {
        let mut data = Map::new();
        data.insert("deviceId".to_string(), json!("stb-1"));
        DecodedEvent::new(data, "2025-01-01T00:00:00.000Z", 0, offset, 0)
    }

    async fn setup(
        ids: &[&str],
        outcomes: &[(&str, DeliveryError)],
    ) -> (BroadcastDispatcher, Arc<MemoryRegistry>, Arc<Recorder>) {
        let registry = Arc::new(MemoryRegistry::new());
        for id in ids {
            registry.register(id, "user").await.unwrap();
        }
        let recorder = Arc::new(Recorder {
            outcomes: outcomes
                .iter()
                .map(|(id, e)| (id.to_string(), e.clone()))
                .collect(),
            ..Recorder::default()
        });
        let dispatcher = BroadcastDispatcher::new(registry.clone(), recorder.clone());
        (dispatcher, registry, recorder)
    }

    #[tokio::test]
    async fn test_no_pushes_without_events() {
        let (dispatcher, registry, recorder) = setup(&["c1", "c2"], &[]).await;
        let connections = registry.list_active().await.unwrap();

        let report = dispatcher.broadcast(&[], &connections).await;

        assert_eq!(report, BroadcastReport::default());
        assert!(recorder.pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_pushes_without_connections() {
        let (dispatcher, _, recorder) = setup(&[], &[]).await;

        let report = dispatcher.broadcast(&[event(1)], &[]).await;

        assert_eq!(report.attempted, 0);
        assert!(recorder.pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_payload_per_connection() {
        let (dispatcher, registry, recorder) = setup(&["c1", "c2", "c3"], &[]).await;
        let connections = registry.list_active().await.unwrap();

        let report = dispatcher
            .broadcast(&[event(1), event(2)], &connections)
            .await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 3);
        let pushes = recorder.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 3);
        // Every connection gets the same shared payload
        assert!(pushes.iter().all(|(_, p)| p == &pushes[0].1));

        let frame: serde_json::Value = serde_json::from_slice(&pushes[0].1).unwrap();
        assert_eq!(frame["action"], "telemetry");
        assert_eq!(frame["events"].as_array().unwrap().len(), 2);
        assert_eq!(frame["events"][0]["offset"], 1);
        assert_eq!(frame["events"][1]["offset"], 2);
    }

    #[tokio::test]
    async fn test_gone_connection_is_pruned() {
        let (dispatcher, registry, _) = setup(&["c1", "c2"], &[("c2", DeliveryError::Gone)]).await;
        let connections = registry.list_active().await.unwrap();

        let report = dispatcher.broadcast(&[event(1)], &connections).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, vec!["c2".to_string()]);
        assert!(registry.contains("c1"));
        assert!(!registry.contains("c2"));
    }

    #[tokio::test]
    async fn test_other_failure_keeps_connection() {
        let (dispatcher, registry, _) = setup(
            &["c1", "c2"],
            &[("c2", DeliveryError::Other("503".to_string()))],
        )
        .await;
        let connections = registry.list_active().await.unwrap();

        let report = dispatcher.broadcast(&[event(1)], &connections).await;

        assert_eq!(report.failed, 1);
        assert!(report.pruned.is_empty());
        assert!(registry.contains("c2"));
    }
}
