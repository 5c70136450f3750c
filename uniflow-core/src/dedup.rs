//! The dedup pipeline front. [UuidDedup] turns an input stream into a deduplicated
//! output stream:
//!
//! ```text
//! (input) --> router --> shard 0..n (dedup state) --> output stage --> (output)
//!                \
//!                 +--> (failed)
//! ```
//!
//! The router extracts the dedup key of every data message and hands the message to
//! the shard owning that key; watermark barriers are broadcast to every shard.
//! Messages whose key cannot be extracted leave the pipeline on the failed stream.
//! The output stage strips the key wrapper so messages come out exactly as they
//! went in, each distinct key at most once per retention window.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::Result;
use crate::config::{DedupConfig, RetryConfig};
use crate::dedup::engine::{ActorMessage, Shard};
use crate::dedup::extractor::{AttributeExtractor, KeyExtractor};
use crate::dedup::partitioner::shard_for;
use crate::dedup::store::{DedupStore, InMemoryStore, StoreFactory};
use crate::message::{DedupKey, FailedMessage, Message, MessageType};
use crate::metrics::{dedup_metrics, shard_labels};

pub(crate) mod engine;
pub mod extractor;
pub mod partitioner;
pub mod store;

/// UuidDedup deduplicates a message stream on producer-stamped keys. Construction
/// validates the config; [UuidDedup::dedup_stream] then starts an independent
/// pipeline per call.
pub struct UuidDedup {
    shard_count: u16,
    channel_size: usize,
    retention: chrono::Duration,
    retry_config: RetryConfig,
    extractor: Arc<dyn KeyExtractor>,
    stores: StoreFactory,
}

impl UuidDedup {
    /// Builds an engine with the default attribute extractor and a per-shard
    /// in-memory store as configured.
    pub fn new(config: DedupConfig) -> Result<Self> {
        let store_config = config.store.clone();
        let stores: StoreFactory = Arc::new(move |_shard_idx| {
            Box::new(InMemoryStore::new(
                store_config.capacity,
                store_config.policy.clone(),
            )) as Box<dyn DedupStore>
        });
        Self::with_parts(config, Arc::new(AttributeExtractor::default()), stores)
    }

    /// Builds an engine from explicit parts, for callers bringing their own key
    /// extraction or store backend.
    pub fn with_parts(
        config: DedupConfig,
        extractor: Arc<dyn KeyExtractor>,
        stores: StoreFactory,
    ) -> Result<Self> {
        config.validate()?;
        let retention = chrono::Duration::from_std(config.retention)
            .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;
        Ok(Self {
            shard_count: config.shard_count,
            channel_size: config.channel_size,
            retention,
            retry_config: config.retry,
            extractor,
            stores,
        })
    }

    /// Starts a dedup pipeline over `input_stream`.
    ///
    /// Returns the deduplicated output stream, the failed stream carrying messages
    /// whose key could not be extracted, and a handle that resolves once the whole
    /// pipeline has stopped, with the first shard failure if any shard halted. The
    /// caller is expected to keep draining the output stream; the pipeline applies
    /// backpressure through its channels, so an abandoned output stream eventually
    /// stalls and fails the shards.
    ///
    /// Watermark barriers are consumed by the pipeline and not forwarded. When the
    /// token is cancelled the router stops reading, everything already in flight is
    /// drained downstream, and the streams close.
    pub fn dedup_stream(
        &self,
        input_stream: ReceiverStream<Message>,
        cln_token: CancellationToken,
    ) -> Result<(
        ReceiverStream<Message>,
        ReceiverStream<FailedMessage>,
        JoinHandle<Result<()>>,
    )> {
        let (output_tx, output_rx) = mpsc::channel(self.channel_size);
        let (failed_tx, failed_rx) = mpsc::channel(self.channel_size);
        let (keyed_tx, keyed_rx) = mpsc::channel(self.channel_size);

        // one actor per shard, each owning its slice of the key space
        let mut shard_txs = Vec::with_capacity(usize::from(self.shard_count));
        let mut shard_handles = Vec::with_capacity(usize::from(self.shard_count));
        for shard_idx in 0..self.shard_count {
            let (tx, rx) = mpsc::channel(self.channel_size);
            let shard = Shard::new(
                shard_idx,
                (self.stores)(shard_idx),
                self.retention,
                self.retry_config.clone(),
                rx,
                keyed_tx.clone(),
            );
            shard_txs.push(tx);
            shard_handles.push(tokio::spawn(shard.run()));
        }
        // the shards hold the only senders now; the output stage stops when the
        // last shard does
        drop(keyed_tx);

        let output_handle = tokio::spawn(Self::run_output_stage(keyed_rx, output_tx));

        let extractor = Arc::clone(&self.extractor);
        let shard_count = self.shard_count;
        let router_handle = tokio::spawn(async move {
            let mut input_stream = input_stream;
            loop {
                tokio::select! {
                    _ = cln_token.cancelled() => {
                        info!("Cancellation token triggered, stopping dedup router");
                        break;
                    }
                    next = input_stream.next() => {
                        let Some(message) = next else { break };
                        match message.typ {
                            MessageType::WMB => {
                                Self::broadcast_watermark(&shard_txs, message).await;
                            }
                            MessageType::Data => {
                                Self::route(&extractor, shard_count, &shard_txs, &failed_tx, message)
                                    .await?;
                            }
                        }
                    }
                }
            }
            Ok(())
        });

        // resolve once the router, every shard, and the output stage have stopped,
        // surfacing the first failure
        let handle = tokio::spawn(async move {
            router_handle
                .await
                .map_err(|e| Error::Forwarder(format!("router task panicked: {e}")))??;
            for result in join_all(shard_handles).await {
                result.map_err(|e| Error::Forwarder(format!("shard task panicked: {e}")))??;
            }
            output_handle
                .await
                .map_err(|e| Error::Forwarder(format!("output stage panicked: {e}")))??;
            Ok(())
        });

        Ok((
            ReceiverStream::new(output_rx),
            ReceiverStream::new(failed_rx),
            handle,
        ))
    }

    /// Hands a data message to the shard owning its key, or to the failed stream
    /// when the key cannot be extracted.
    async fn route(
        extractor: &Arc<dyn KeyExtractor>,
        shard_count: u16,
        shard_txs: &[mpsc::Sender<ActorMessage>],
        failed_tx: &mpsc::Sender<FailedMessage>,
        message: Message,
    ) -> Result<()> {
        match extractor.extract(&message) {
            Ok(key) => {
                let shard = shard_for(&key, shard_count);
                let tx = shard_txs.get(usize::from(shard)).ok_or_else(|| {
                    Error::Forwarder(format!("no shard {shard} among {shard_count} shards"))
                })?;
                if tx.send(ActorMessage::Record { key, message }).await.is_err() {
                    // the shard halted; its error surfaces when the pipeline is joined
                    error!(shard, "Shard has stopped, dropping message");
                    dedup_metrics()
                        .dropped_total
                        .get_or_create(&shard_labels(shard))
                        .inc();
                }
            }
            Err(error) => {
                warn!(
                    %error,
                    offset = message.offset,
                    "Cannot extract dedup key, routing to the failed stream"
                );
                dedup_metrics()
                    .failed_total
                    .get_or_create(&Vec::new())
                    .inc();
                if failed_tx.send(FailedMessage { message, error }).await.is_err() {
                    debug!("Failed stream receiver dropped, discarding failed message");
                }
            }
        }
        Ok(())
    }

    /// Sends a barrier's watermark to every shard. Shards that already halted are
    /// skipped.
    async fn broadcast_watermark(shard_txs: &[mpsc::Sender<ActorMessage>], message: Message) {
        let Some(watermark) = message.watermark else {
            warn!(offset = message.offset, "WMB without a watermark, ignoring");
            return;
        };
        for (shard_idx, tx) in shard_txs.iter().enumerate() {
            if tx
                .send(ActorMessage::WatermarkAdvance { watermark })
                .await
                .is_err()
            {
                debug!(shard = shard_idx, "Shard has stopped, skipping watermark");
            }
        }
    }

    /// Strips the key wrapper and forwards emissions in the order the shards
    /// produced them.
    async fn run_output_stage(
        mut keyed_rx: mpsc::Receiver<(DedupKey, Message)>,
        output_tx: mpsc::Sender<Message>,
    ) -> Result<()> {
        while let Some((_key, message)) = keyed_rx.recv().await {
            if output_tx.send(message).await.is_err() {
                debug!("Output receiver dropped, stopping output stage");
                break;
            }
        }
        Ok(())
    }
}
