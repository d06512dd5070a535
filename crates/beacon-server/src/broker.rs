//! Batch sources and the consumer loop.
//!
//! Batches are consumed strictly one at a time. A batch is committed only
//! after the consumer returns `Ok`; a configuration error leaves it
//! uncommitted so it is redelivered.

use anyhow::{Context, Result};
use async_trait::async_trait;
use beacon_core::{group_by_partition, BrokerConsumer, BrokerMessage, MemoryRegistry, RawBatch};
use beacon_auth::JwksCache;
use bytes::Bytes;
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout_at;
use tracing::{debug, error, info};

use crate::metrics;

/// Pause before polling again after a source error.
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A stream of broker batches.
#[async_trait]
pub trait BatchSource: Send {
    /// Wait for the next batch. `None` means the source is exhausted.
    async fn next_batch(&mut self) -> Result<Option<RawBatch>>;

    /// Mark the last batch returned by `next_batch` as processed.
    async fn commit(&mut self) -> Result<()>;

    /// Source name for logging.
    fn name(&self) -> &'static str;
}

/// In-process source fed through an [`IngestHandle`].
pub struct ChannelSource {
    rx: mpsc::Receiver<BrokerMessage>,
    batch_size: usize,
    linger: Duration,
    pending: usize,
    committed: u64,
}

impl ChannelSource {
    /// Create a source and the handle that feeds it.
    #[must_use]
    pub fn new(topic: impl Into<String>, batch_size: usize, linger: Duration) -> (Self, IngestHandle) {
        let (tx, rx) = mpsc::channel(batch_size.max(1) * 4);
        let source = Self {
            rx,
            batch_size: batch_size.max(1),
            linger,
            pending: 0,
            committed: 0,
        };
        let handle = IngestHandle {
            tx,
            topic: topic.into(),
            next_offset: Arc::new(AtomicI64::new(0)),
        };
        (source, handle)
    }

    /// Records committed so far.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.committed
    }
}

#[async_trait]
impl BatchSource for ChannelSource {
    async fn next_batch(&mut self) -> Result<Option<RawBatch>> {
        let Some(first) = self.rx.recv().await else {
            return Ok(None);
        };

        let deadline = tokio::time::Instant::now() + self.linger;
        let mut messages = vec![first];
        while messages.len() < self.batch_size {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) | Err(_) => break,
            }
        }

        self.pending = messages.len();
        Ok(Some(group_by_partition(messages)))
    }

    async fn commit(&mut self) -> Result<()> {
        self.committed += self.pending as u64;
        self.pending = 0;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Producer side of a [`ChannelSource`].
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<BrokerMessage>,
    topic: String,
    next_offset: Arc<AtomicI64>,
}

impl IngestHandle {
    /// Enqueue one record on partition 0. Returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the source has shut down.
    pub async fn publish(&self, payload: Bytes) -> Result<i64> {
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
        let message = BrokerMessage::new(
            self.topic.clone(),
            0,
            offset,
            Utc::now().timestamp_millis(),
            payload,
        );
        self.tx
            .send(message)
            .await
            .context("Batch source is closed")?;
        Ok(offset)
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaSource;

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use crate::config::BrokerConfig;
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::message::Message as KafkaMessage;
    use std::collections::HashMap;
    use tracing::warn;

    /// Kafka topic source.
    ///
    /// Starts from the latest offset. Offsets are stored only on commit and
    /// flushed by the client's auto-commit.
    pub struct KafkaSource {
        consumer: StreamConsumer,
        batch_size: usize,
        linger: Duration,
        /// Highest offset seen per (topic, partition) in the pending batch.
        pending: HashMap<(String, i32), i64>,
    }

    impl KafkaSource {
        /// Create a consumer and subscribe to the configured topic.
        ///
        /// # Errors
        ///
        /// Returns an error if the client cannot be created or subscribed.
        pub fn connect(config: &BrokerConfig) -> Result<Self> {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &config.brokers)
                .set("group.id", &config.group_id)
                .set("enable.auto.commit", "true")
                .set("enable.auto.offset.store", "false")
                .set("auto.offset.reset", "latest")
                .create()
                .context("Failed to create Kafka consumer")?;

            consumer
                .subscribe(&[config.topic.as_str()])
                .with_context(|| format!("Failed to subscribe to {}", config.topic))?;

            info!(brokers = %config.brokers, topic = %config.topic, group = %config.group_id, "Kafka consumer subscribed");

            Ok(Self {
                consumer,
                batch_size: config.batch_size.max(1),
                linger: config.linger(),
                pending: HashMap::new(),
            })
        }

        fn track(&mut self, message: &BrokerMessage) {
            let key = (message.topic.clone(), message.partition);
            let offset = self.pending.entry(key).or_insert(message.offset);
            *offset = (*offset).max(message.offset);
        }
    }

    fn to_broker_message(message: &rdkafka::message::BorrowedMessage<'_>) -> BrokerMessage {
        BrokerMessage::new(
            message.topic(),
            message.partition(),
            message.offset(),
            message.timestamp().to_millis().unwrap_or_default(),
            Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        )
    }

    #[async_trait]
    impl BatchSource for KafkaSource {
        async fn next_batch(&mut self) -> Result<Option<RawBatch>> {
            let first = {
                let message = self.consumer.recv().await.context("Kafka receive failed")?;
                to_broker_message(&message)
            };
            self.track(&first);

            let deadline = tokio::time::Instant::now() + self.linger;
            let mut messages = vec![first];
            while messages.len() < self.batch_size {
                let next = match timeout_at(deadline, self.consumer.recv()).await {
                    Ok(Ok(message)) => to_broker_message(&message),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Kafka receive failed mid-batch");
                        break;
                    }
                    Err(_) => break,
                };
                self.track(&next);
                messages.push(next);
            }

            Ok(Some(group_by_partition(messages)))
        }

        async fn commit(&mut self) -> Result<()> {
            for ((topic, partition), offset) in self.pending.drain() {
                // The stored offset is the next record to read.
                self.consumer
                    .store_offset(&topic, partition, offset + 1)
                    .with_context(|| format!("Failed to store offset {topic}-{partition}"))?;
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "kafka"
        }
    }
}

/// Consume batches from `source` until it is exhausted or `shutdown`
/// completes.
///
/// Source and commit failures are logged and the loop carries on. A batch
/// whose commit failed is redelivered by the source.
///
/// # Errors
///
/// None at present. Failures are logged rather than returned.
pub async fn run_consumer<S, F>(mut source: S, consumer: Arc<BrokerConsumer>, shutdown: F) -> Result<()>
where
    S: BatchSource,
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    info!(source = source.name(), "Consumer loop started");

    loop {
        let next = tokio::select! {
            biased;
            () = &mut shutdown => {
                info!("Consumer loop stopping");
                break;
            }
            next = source.next_batch() => next,
        };

        let batch = match next {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                info!("Batch source closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read batch");
                metrics::record_error("source");
                tokio::time::sleep(SOURCE_ERROR_BACKOFF).await;
                continue;
            }
        };

        let start = Instant::now();
        match consumer.consume(&batch).await {
            Ok(outcome) => {
                metrics::record_batch(&outcome, start.elapsed().as_secs_f64());
                if let Err(e) = source.commit().await {
                    error!(error = %e, "Failed to commit batch");
                    metrics::record_error("commit");
                    continue;
                }
                debug!(events = outcome.events.len(), "Batch committed");
            }
            Err(e) => {
                metrics::record_error("configuration");
                error!(error = %e, "Batch left uncommitted");
            }
        }
    }

    Ok(())
}

/// Periodically remove expired registrations until `shutdown` completes.
pub async fn run_sweeper<F>(
    registry: Arc<MemoryRegistry>,
    jwks: Option<Arc<JwksCache>>,
    interval: Duration,
    shutdown: F,
) where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let swept = registry.sweep_expired(Utc::now());
        if !swept.is_empty() {
            info!(count = swept.len(), "Swept expired registrations");
            metrics::record_swept(swept.len());
        }
        metrics::set_registered_connections(registry.len());
        if let Some(jwks) = &jwks {
            metrics::set_jwks_refreshes(jwks.refreshes());
        }
    }
}
