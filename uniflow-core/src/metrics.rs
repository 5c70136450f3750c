use std::iter;
use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::Error;
use crate::Result;

// Define the labels for the metrics
const SHARD_LABEL: &str = "shard";

// The top-level metric registry is created with the GLOBAL_PREFIX
const DEDUP_REGISTRY_GLOBAL_PREFIX: &str = "uniflow";

// Define the metrics
// Note: We do not add a suffix to the metric name, as the suffix is inferred through
// the metric type by the prometheus client library
// refer: https://github.com/prometheus/client_rust/blob/master/src/registry.rs#L102

// counters (please note the prefix _total, and read above link)
const READ_TOTAL: &str = "read";
const EMITTED_TOTAL: &str = "emitted";
const DUPLICATE_TOTAL: &str = "duplicate";
const PURGED_TOTAL: &str = "purged";
const FAILED_TOTAL: &str = "failed";
const DROPPED_TOTAL: &str = "dropped";

// pending as gauge
const TRACKED_KEYS: &str = "tracked_keys";

// processing times as timers
const PROCESSING_TIME: &str = "processing_time";

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

/// global_registry is a helper function to get the GLOBAL_REGISTRY
fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

struct GlobalRegistry {
    // It is okay to use std mutex because we register each metric only one time.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

/// DedupMetrics is a struct which is used for storing the metrics of the dedup
/// pipeline.
// These fields are exposed as pub(crate) to be used by other modules for
// changing the value of the metrics.
// Each metric is defined as family of metrics, which means that they can be
// differentiated by their label values assigned, here the owning shard.
// The labels are provided in the form of Vec<(String, String)>
// The second argument is the metric kind.
pub(crate) struct DedupMetrics {
    // counters
    pub(crate) read_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) emitted_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) duplicate_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) purged_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) failed_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) dropped_total: Family<Vec<(String, String)>, Counter>,

    // gauge
    pub(crate) tracked_keys: Family<Vec<(String, String)>, Gauge>,

    // timers
    pub(crate) processing_time: Family<Vec<(String, String)>, Histogram>,
}

/// Exponential bucket distribution with range.
/// Creates `length` buckets, where the lowest bucket is `min` and the highest bucket is `max`.
/// The final +Inf bucket is not counted and not included in the returned iterator.
/// The function panics if `length` is 0 or negative, or if `min` is 0 or negative.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    if length < 1 {
        panic!("ExponentialBucketsRange length needs a positive length");
    }
    if min <= 0.0 {
        panic!("ExponentialBucketsRange min needs to be greater than 0");
    }

    // We know max/min and highest bucket. Solve for growth_factor.
    let growth_factor = (max / min).powf(1.0 / (length as f64 - 1.0));

    iter::repeat(())
        .enumerate()
        .map(move |(i, _)| min * growth_factor.powf(i as f64))
        .take(length.into())
}

impl DedupMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::<Vec<(String, String)>, Counter>::default(),
            emitted_total: Family::<Vec<(String, String)>, Counter>::default(),
            duplicate_total: Family::<Vec<(String, String)>, Counter>::default(),
            purged_total: Family::<Vec<(String, String)>, Counter>::default(),
            failed_total: Family::<Vec<(String, String)>, Counter>::default(),
            dropped_total: Family::<Vec<(String, String)>, Counter>::default(),
            // gauge
            tracked_keys: Family::<Vec<(String, String)>, Gauge>::default(),
            // timers
            // exponential buckets in the range 100 microseconds to 1 minute
            processing_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(
                || Histogram::new(exponential_buckets_range(100.0, 60000000.0, 10)),
            ),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(DEDUP_REGISTRY_GLOBAL_PREFIX);
        // Register all the metrics to the global registry
        registry.register(
            READ_TOTAL,
            "A Counter to keep track of the total number of data messages read from the input stream",
            metrics.read_total.clone(),
        );
        registry.register(
            EMITTED_TOTAL,
            "A Counter to keep track of the total number of first sightings emitted on the output stream",
            metrics.emitted_total.clone(),
        );
        registry.register(
            DUPLICATE_TOTAL,
            "A Counter to keep track of the total number of messages dropped as duplicates",
            metrics.duplicate_total.clone(),
        );
        registry.register(
            PURGED_TOTAL,
            "A Counter to keep track of the total number of dedup entries removed by watermark GC",
            metrics.purged_total.clone(),
        );
        registry.register(
            FAILED_TOTAL,
            "A Counter to keep track of the total number of messages routed to the failed stream",
            metrics.failed_total.clone(),
        );
        registry.register(
            DROPPED_TOTAL,
            "A Counter to keep track of the total number of messages dropped because their shard had halted",
            metrics.dropped_total.clone(),
        );
        registry.register(
            TRACKED_KEYS,
            "A Gauge to keep track of the number of keys currently tracked in the store",
            metrics.tracked_keys.clone(),
        );
        registry.register(
            PROCESSING_TIME,
            "A Histogram to keep track of the total time taken to dedup a message, in microseconds",
            metrics.processing_time.clone(),
        );
        metrics
    }
}

/// DEDUP_METRICS is the DedupMetrics object which stores the metrics
static DEDUP_METRICS: OnceLock<DedupMetrics> = OnceLock::new();

pub(crate) fn dedup_metrics() -> &'static DedupMetrics {
    DEDUP_METRICS.get_or_init(DedupMetrics::new)
}

/// Labels identifying the shard a metric belongs to.
pub(crate) fn shard_labels(shard_idx: u16) -> Vec<(String, String)> {
    vec![(SHARD_LABEL.to_string(), shard_idx.to_string())]
}

/// Text-encodes everything gathered in the global registry, in the Prometheus
/// exposition format, so the caller can expose or log it.
pub fn encode_metrics() -> Result<String> {
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(format!("{e:?}")))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once_and_encode() {
        let metrics = dedup_metrics();
        metrics
            .emitted_total
            .get_or_create(&shard_labels(0))
            .inc();

        let text = encode_metrics().unwrap();
        assert!(text.contains("uniflow_emitted_total"));
        assert!(text.contains("shard=\"0\""));
    }

    #[test]
    fn exponential_buckets_span_range() {
        let buckets: Vec<f64> = exponential_buckets_range(100.0, 60000000.0, 10).collect();
        assert_eq!(buckets.len(), 10);
        assert!((buckets.first().unwrap() - 100.0).abs() < 1e-9);
        assert!((buckets.last().unwrap() - 60000000.0).abs() < 1e-3);
    }
}
