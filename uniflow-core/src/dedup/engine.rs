//! A shard of the dedup engine, written as an actor owning its share of the state.
//! The router is the only sender to a shard's channel, so a shard sees its messages
//! strictly in arrival order: first sightings are recorded and emitted, repeats are
//! dropped, and every watermark advance garbage-collects entries the watermark has
//! moved past. A shard that cannot reach its store even after retries halts with an
//! error; the other shards are unaffected.

use backoff::retry::retry;
use backoff::strategy::exponential::Exponential;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::Error;
use crate::Result;
use crate::config::RetryConfig;
use crate::dedup::store::{DedupStore, StoreError};
use crate::message::{DedupKey, Message};
use crate::metrics::{dedup_metrics, shard_labels};

/// ActorMessage represents the messages that can be sent to a shard actor.
pub(crate) enum ActorMessage {
    /// a keyed data message to deduplicate
    Record { key: DedupKey, message: Message },
    /// a watermark observation, advancing the shard's clock
    WatermarkAdvance { watermark: DateTime<Utc> },
    #[cfg(test)]
    TrackedKeys {
        respond_to: tokio::sync::oneshot::Sender<usize>,
    },
}

/// Shard is responsible for deduplicating the slice of the key space assigned to it.
/// It exclusively owns its [DedupStore] and its watermark, which only ever moves
/// forward.
pub(crate) struct Shard {
    shard_idx: u16,
    store: Box<dyn DedupStore>,
    /// highest watermark observed so far, None until the first observation
    watermark: Option<DateTime<Utc>>,
    retention: chrono::Duration,
    retry_config: RetryConfig,
    receiver: mpsc::Receiver<ActorMessage>,
    output_tx: mpsc::Sender<(DedupKey, Message)>,
    labels: Vec<(String, String)>,
}

/// Backoff applied between attempts on a transiently failing store.
fn retry_strategy(config: &RetryConfig) -> impl Iterator<Item = std::time::Duration> {
    Exponential::new(
        config.base_interval,
        config.max_interval,
        config.factor,
        config.jitter,
    )
    .take(config.max_retries.into())
}

fn map_store_error(shard_idx: u16, err: StoreError) -> Error {
    match err {
        StoreError::Capacity(tracked) => Error::StoreCapacity(format!(
            "shard {shard_idx} is full with {tracked} keys tracked"
        )),
        err @ StoreError::Transient(_) => Error::Store(format!("shard {shard_idx}: {err}")),
    }
}

impl Shard {
    pub(crate) fn new(
        shard_idx: u16,
        store: Box<dyn DedupStore>,
        retention: chrono::Duration,
        retry_config: RetryConfig,
        receiver: mpsc::Receiver<ActorMessage>,
        output_tx: mpsc::Sender<(DedupKey, Message)>,
    ) -> Self {
        Self {
            shard_idx,
            store,
            watermark: None,
            retention,
            retry_config,
            receiver,
            output_tx,
            labels: shard_labels(shard_idx),
        }
    }

    /// Runs the shard until its channel closes or a store failure halts it.
    pub(crate) async fn run(mut self) -> Result<()> {
        info!(shard = self.shard_idx, "Starting dedup shard");
        while let Some(msg) = self.receiver.recv().await {
            self.handle_message(msg).await?;
        }
        info!(shard = self.shard_idx, "Dedup shard stopped, input closed");
        Ok(())
    }

    async fn handle_message(&mut self, msg: ActorMessage) -> Result<()> {
        match msg {
            ActorMessage::Record { key, message } => self.handle_record(key, message).await,
            ActorMessage::WatermarkAdvance { watermark } => {
                self.advance_watermark(watermark).await
            }
            #[cfg(test)]
            ActorMessage::TrackedKeys { respond_to } => {
                let tracked = self.store.tracked().await.unwrap_or(0);
                let _ = respond_to.send(tracked);
                Ok(())
            }
        }
    }

    /// Deduplicates one data message: emit and remember a first sighting, drop a
    /// repeat. A watermark carried on the message is the clock observed at its
    /// arrival, so it is applied only after the message itself is processed.
    async fn handle_record(&mut self, key: DedupKey, message: Message) -> Result<()> {
        let start_time = tokio::time::Instant::now();
        let watermark = message.watermark;
        dedup_metrics().read_total.get_or_create(&self.labels).inc();

        if self.seen_with_retry(&key).await? {
            debug!(
                shard = self.shard_idx,
                %key,
                offset = message.offset,
                "Dropping duplicate"
            );
            dedup_metrics()
                .duplicate_total
                .get_or_create(&self.labels)
                .inc();
        } else {
            self.record_with_retry(&key, message.event_time).await?;
            self.output_tx.send((key, message)).await.map_err(|_| {
                Error::Forwarder(
                    "failed to send message to the output stage, receiver dropped".to_string(),
                )
            })?;
            dedup_metrics()
                .emitted_total
                .get_or_create(&self.labels)
                .inc();
        }

        dedup_metrics()
            .processing_time
            .get_or_create(&self.labels)
            .observe(start_time.elapsed().as_micros() as f64);

        if let Some(watermark) = watermark {
            self.advance_watermark(watermark).await?;
        }
        Ok(())
    }

    /// Moves the shard's watermark forward and purges entries older than
    /// watermark - retention. Stale observations are ignored; the watermark never
    /// regresses.
    async fn advance_watermark(&mut self, observed: DateTime<Utc>) -> Result<()> {
        if self.watermark.is_some_and(|current| observed <= current) {
            return Ok(());
        }
        self.watermark = Some(observed);

        // an underflowing cutoff predates every representable entry, nothing to purge
        if let Some(cutoff) = observed.checked_sub_signed(self.retention) {
            let purged = self.purge_with_retry(cutoff).await?;
            if purged > 0 {
                debug!(
                    shard = self.shard_idx,
                    %cutoff,
                    purged,
                    "Purged entries past retention"
                );
                dedup_metrics()
                    .purged_total
                    .get_or_create(&self.labels)
                    .inc_by(purged as u64);
            }
        }
        if let Ok(tracked) = self.store.tracked().await {
            dedup_metrics()
                .tracked_keys
                .get_or_create(&self.labels)
                .set(tracked as i64);
        }
        Ok(())
    }

    async fn seen_with_retry(&self, key: &DedupKey) -> Result<bool> {
        retry(
            retry_strategy(&self.retry_config),
            async || self.store.seen(key).await,
            StoreError::is_transient,
        )
        .await
        .map_err(|e| map_store_error(self.shard_idx, e))
    }

    async fn record_with_retry(&self, key: &DedupKey, event_time: DateTime<Utc>) -> Result<()> {
        retry(
            retry_strategy(&self.retry_config),
            async || self.store.record_first_seen(key.clone(), event_time).await,
            StoreError::is_transient,
        )
        .await
        .map_err(|e| map_store_error(self.shard_idx, e))
    }

    async fn purge_with_retry(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        retry(
            retry_strategy(&self.retry_config),
            async || self.store.purge_before(cutoff).await,
            StoreError::is_transient,
        )
        .await
        .map_err(|e| map_store_error(self.shard_idx, e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeZone;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::config::CapacityPolicy;
    use crate::dedup::store::InMemoryStore;

    fn event_time(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn data_message(offset: i64, et_millis: i64, watermark: Option<i64>) -> Message {
        Message {
            offset,
            event_time: event_time(et_millis),
            watermark: watermark.map(event_time),
            ..Default::default()
        }
    }

    fn spawn_shard(
        store: Box<dyn DedupStore>,
        retention_secs: i64,
    ) -> (
        mpsc::Sender<ActorMessage>,
        mpsc::Receiver<(DedupKey, Message)>,
        JoinHandle<Result<()>>,
    ) {
        spawn_shard_with_retry(store, retention_secs, RetryConfig::default())
    }

    fn spawn_shard_with_retry(
        store: Box<dyn DedupStore>,
        retention_secs: i64,
        retry_config: RetryConfig,
    ) -> (
        mpsc::Sender<ActorMessage>,
        mpsc::Receiver<(DedupKey, Message)>,
        JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let (output_tx, output_rx) = mpsc::channel(16);
        let shard = Shard::new(
            0,
            store,
            chrono::Duration::seconds(retention_secs),
            retry_config,
            rx,
            output_tx,
        );
        (tx, output_rx, tokio::spawn(shard.run()))
    }

    /// Millisecond-scale retry pauses without jitter, so retry tests run quickly
    /// and count attempts deterministically.
    fn quick_retry() -> RetryConfig {
        RetryConfig {
            base_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
            max_retries: 5,
        }
    }

    /// Wraps an [InMemoryStore] and rejects the first `failures` writes with a
    /// transient error, counting every write attempt.
    struct IntermittentStore {
        inner: InMemoryStore,
        failures_left: AtomicUsize,
        write_attempts: Arc<AtomicUsize>,
    }

    impl IntermittentStore {
        fn new(failures: usize) -> (Self, Arc<AtomicUsize>) {
            let write_attempts = Arc::new(AtomicUsize::new(0));
            let store = Self {
                inner: InMemoryStore::default(),
                failures_left: AtomicUsize::new(failures),
                write_attempts: Arc::clone(&write_attempts),
            };
            (store, write_attempts)
        }
    }

    #[async_trait::async_trait]
    impl DedupStore for IntermittentStore {
        async fn seen(&self, key: &DedupKey) -> std::result::Result<bool, StoreError> {
            self.inner.seen(key).await
        }

        async fn record_first_seen(
            &self,
            key: DedupKey,
            event_time: DateTime<Utc>,
        ) -> std::result::Result<(), StoreError> {
            self.write_attempts.fetch_add(1, Ordering::Relaxed);
            if self.failures_left.load(Ordering::Relaxed) > 0 {
                self.failures_left.fetch_sub(1, Ordering::Relaxed);
                return Err(StoreError::Transient("store unavailable".to_string()));
            }
            self.inner.record_first_seen(key, event_time).await
        }

        async fn purge_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> std::result::Result<usize, StoreError> {
            self.inner.purge_before(cutoff).await
        }

        async fn tracked(&self) -> std::result::Result<usize, StoreError> {
            self.inner.tracked().await
        }
    }

    async fn drain(mut output_rx: mpsc::Receiver<(DedupKey, Message)>) -> Vec<(DedupKey, Message)> {
        let mut emitted = vec![];
        while let Some(entry) = output_rx.recv().await {
            emitted.push(entry);
        }
        emitted
    }

    #[tokio::test]
    async fn emits_first_sighting_and_drops_repeats() {
        let (tx, output_rx, handle) = spawn_shard(Box::new(InMemoryStore::default()), 600);
        let key = DedupKey::random();

        for offset in 0..3 {
            tx.send(ActorMessage::Record {
                key: key.clone(),
                message: data_message(offset, 60_000, None),
            })
            .await
            .unwrap();
        }
        drop(tx);

        let emitted = drain(output_rx).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, key);
        assert_eq!(emitted[0].1.offset, 0);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn watermark_gc_makes_room_for_reemission() {
        let (tx, output_rx, handle) = spawn_shard(Box::new(InMemoryStore::default()), 10);
        let key = DedupKey::random();

        tx.send(ActorMessage::Record {
            key: key.clone(),
            message: data_message(0, 60_000, None),
        })
        .await
        .unwrap();
        // one millisecond past first-seen + retention, the entry is purged
        tx.send(ActorMessage::WatermarkAdvance {
            watermark: event_time(70_001),
        })
        .await
        .unwrap();
        tx.send(ActorMessage::Record {
            key: key.clone(),
            message: data_message(1, 60_000, None),
        })
        .await
        .unwrap();
        drop(tx);

        let emitted = drain(output_rx).await;
        assert_eq!(emitted.len(), 2);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn watermark_at_retention_boundary_keeps_the_entry() {
        let (tx, output_rx, handle) = spawn_shard(Box::new(InMemoryStore::default()), 10);
        let key = DedupKey::random();

        tx.send(ActorMessage::Record {
            key: key.clone(),
            message: data_message(0, 60_000, None),
        })
        .await
        .unwrap();
        // exactly first-seen + retention, the entry still dedupes
        tx.send(ActorMessage::WatermarkAdvance {
            watermark: event_time(70_000),
        })
        .await
        .unwrap();
        tx.send(ActorMessage::Record {
            key: key.clone(),
            message: data_message(1, 60_000, None),
        })
        .await
        .unwrap();
        drop(tx);

        let emitted = drain(output_rx).await;
        assert_eq!(emitted.len(), 1);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_watermarks_are_ignored() {
        let (tx, output_rx, handle) = spawn_shard(Box::new(InMemoryStore::default()), 10);

        tx.send(ActorMessage::Record {
            key: DedupKey::random(),
            message: data_message(0, 60_000, None),
        })
        .await
        .unwrap();
        tx.send(ActorMessage::WatermarkAdvance {
            watermark: event_time(69_000),
        })
        .await
        .unwrap();
        // late entry, already within one second of the last cutoff
        tx.send(ActorMessage::Record {
            key: DedupKey::random(),
            message: data_message(1, 58_000, None),
        })
        .await
        .unwrap();
        // a regression; if it were applied the cutoff would pass 58_000
        tx.send(ActorMessage::WatermarkAdvance {
            watermark: event_time(68_500),
        })
        .await
        .unwrap();

        let (ask, answer) = oneshot::channel();
        tx.send(ActorMessage::TrackedKeys { respond_to: ask })
            .await
            .unwrap();
        assert_eq!(answer.await.unwrap(), 2);

        drop(tx);
        let emitted = drain(output_rx).await;
        assert_eq!(emitted.len(), 2);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn carried_watermark_applies_after_the_message() {
        let (tx, output_rx, handle) = spawn_shard(Box::new(InMemoryStore::default()), 10);
        let key = DedupKey::random();

        // the carried watermark is already past event_time + retention, so the entry
        // is recorded, emitted, and then immediately purged
        tx.send(ActorMessage::Record {
            key: key.clone(),
            message: data_message(0, 50_000, Some(70_000)),
        })
        .await
        .unwrap();
        tx.send(ActorMessage::Record {
            key: key.clone(),
            message: data_message(1, 50_000, None),
        })
        .await
        .unwrap();
        drop(tx);

        let emitted = drain(output_rx).await;
        assert_eq!(emitted.len(), 2);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn halts_on_capacity_when_failing_fast() {
        let store = InMemoryStore::new(Some(1), CapacityPolicy::FailFast);
        let (tx, output_rx, handle) = spawn_shard(Box::new(store), 600);

        tx.send(ActorMessage::Record {
            key: DedupKey::random(),
            message: data_message(0, 60_000, None),
        })
        .await
        .unwrap();
        tx.send(ActorMessage::Record {
            key: DedupKey::random(),
            message: data_message(1, 61_000, None),
        })
        .await
        .unwrap();
        drop(tx);

        let emitted = drain(output_rx).await;
        assert_eq!(emitted.len(), 1);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::StoreCapacity(_))));
    }

    #[tokio::test]
    async fn recovers_from_a_transient_store_outage() {
        let (store, write_attempts) = IntermittentStore::new(2);
        let (tx, output_rx, handle) = spawn_shard_with_retry(Box::new(store), 600, quick_retry());

        tx.send(ActorMessage::Record {
            key: DedupKey::random(),
            message: data_message(0, 60_000, None),
        })
        .await
        .unwrap();
        drop(tx);

        let emitted = drain(output_rx).await;
        assert_eq!(emitted.len(), 1);
        // two rejected writes, then the one that stuck
        assert_eq!(write_attempts.load(Ordering::Relaxed), 3);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn halts_when_a_store_outage_outlives_the_retries() {
        let (store, write_attempts) = IntermittentStore::new(usize::MAX);
        let (tx, output_rx, handle) = spawn_shard_with_retry(Box::new(store), 600, quick_retry());

        tx.send(ActorMessage::Record {
            key: DedupKey::random(),
            message: data_message(0, 60_000, None),
        })
        .await
        .unwrap();
        drop(tx);

        let emitted = drain(output_rx).await;
        assert!(emitted.is_empty());
        // the first attempt plus one per configured retry, nothing beyond
        assert_eq!(write_attempts.load(Ordering::Relaxed), 6);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn survives_a_watermark_at_the_minimum_representable_time() {
        let (tx, output_rx, handle) = spawn_shard(Box::new(InMemoryStore::default()), 600);
        let key = DedupKey::random();

        // retention reaches below the representable range here; the purge is
        // skipped and the shard keeps deduplicating
        tx.send(ActorMessage::WatermarkAdvance {
            watermark: DateTime::<Utc>::MIN_UTC,
        })
        .await
        .unwrap();
        for offset in 0..2 {
            tx.send(ActorMessage::Record {
                key: key.clone(),
                message: data_message(offset, 60_000, None),
            })
            .await
            .unwrap();
        }
        drop(tx);

        let emitted = drain(output_rx).await;
        assert_eq!(emitted.len(), 1);
        handle.await.unwrap().unwrap();
    }
}
