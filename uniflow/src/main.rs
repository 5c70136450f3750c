use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uniflow_core::UuidDedup;
use uniflow_core::config::DedupConfig;
use uniflow_core::dedup::extractor::DEFAULT_KEY_ATTRIBUTE;
use uniflow_core::message::{DedupKey, FailedMessage, Message};
use uniflow_core::metrics::encode_metrics;

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

/// Drives a self-contained pipeline: a producer stamping messages with dedup keys
/// and replaying some of them, the dedup engine, and counters on both of its
/// output streams.
async fn run() -> Result<(), Box<dyn Error>> {
    let config = config_from_env()?;
    let total = env_parse("UNIFLOW_MESSAGES", 1_000_i64)?;
    info!(?config, total, "Starting uniflow");

    let engine = UuidDedup::new(config)?;
    let (input_tx, input_rx) = mpsc::channel(500);
    let (output_stream, failed_stream, handle) =
        engine.dedup_stream(ReceiverStream::new(input_rx), CancellationToken::new())?;

    let producer = tokio::spawn(produce(input_tx, total, 100));
    let emitted_task = tokio::spawn(count_emitted(output_stream));
    let failed_task = tokio::spawn(count_failed(failed_stream));

    producer.await?;
    let emitted = emitted_task.await?;
    let failed = failed_task.await?;
    handle.await??;

    info!(total, emitted, failed, "Pipeline finished");
    info!("Metrics\n{}", encode_metrics()?);
    Ok(())
}

/// Stamps and emits `total` data messages where every third message replays the
/// key right before it, with a watermark barrier after every `barrier_every`
/// messages.
async fn produce(input_tx: mpsc::Sender<Message>, total: i64, barrier_every: i64) {
    let started = Utc::now();
    let mut previous: Option<DedupKey> = None;
    for offset in 0..total {
        let key = match previous.take() {
            Some(prev) if offset % 3 == 2 => prev,
            _ => DedupKey::random(),
        };
        previous = Some(key.clone());

        let event_time = started + chrono::Duration::milliseconds(offset);
        let message = Message {
            value: Bytes::from(format!("payload-{offset}")),
            attributes: Arc::new(HashMap::from([(
                DEFAULT_KEY_ATTRIBUTE.to_string(),
                vec![key.as_bytes().clone()],
            )])),
            offset,
            event_time,
            ..Default::default()
        };
        if input_tx.send(message).await.is_err() {
            warn!("Input receiver dropped, stopping producer");
            return;
        }

        if (offset + 1) % barrier_every == 0
            && input_tx.send(Message::wmb(event_time)).await.is_err()
        {
            warn!("Input receiver dropped, stopping producer");
            return;
        }
    }
    info!(total, "Producer finished");
}

async fn count_emitted(mut stream: ReceiverStream<Message>) -> u64 {
    let mut emitted = 0u64;
    let mut sample: Option<String> = None;
    while let Some(message) = stream.next().await {
        if sample.is_none() {
            sample = serde_json::to_string(&message).ok();
        }
        emitted += 1;
    }
    if let Some(sample) = sample {
        info!(message = %sample, "First emitted message");
    }
    emitted
}

async fn count_failed(mut stream: ReceiverStream<FailedMessage>) -> u64 {
    let mut failed = 0u64;
    while let Some(failure) = stream.next().await {
        warn!(
            error = %failure.error,
            offset = failure.message.offset,
            "Message left the pipeline unkeyed"
        );
        failed += 1;
    }
    failed
}

/// Reads the engine tuning from the environment, falling back to the defaults.
fn config_from_env() -> Result<DedupConfig, Box<dyn Error>> {
    let defaults = DedupConfig::default();
    Ok(DedupConfig {
        shard_count: env_parse("UNIFLOW_SHARD_COUNT", defaults.shard_count)?,
        retention: Duration::from_secs(env_parse(
            "UNIFLOW_RETENTION_SECS",
            defaults.retention.as_secs(),
        )?),
        ..defaults
    })
}

fn env_parse<T>(name: &str, default: T) -> Result<T, Box<dyn Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| format!("parsing {name}={value}: {e}").into()),
        Err(_) => Ok(default),
    }
}
