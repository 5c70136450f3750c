//! Message is the unit that flows through the dedup pipeline, from the input stream
//! till it is emitted on the output stream. Payload and attributes are kept opaque;
//! the only field the engine interprets besides the routing metadata is the
//! deduplication key carried in the attributes (or wherever a custom
//! [extractor](crate::dedup::extractor::KeyExtractor) finds it). Encoding at the
//! process boundary is the caller's concern, hence the serde derives.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// The message that is passed from the input stream to the output stream.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Type of the message that flows through the pipeline.
    pub typ: MessageType,
    /// actual payload of the message
    pub value: Bytes,
    /// attributes of the message, each attribute can carry multiple values
    pub attributes: Arc<HashMap<String, Vec<Bytes>>>,
    /// offset assigned by the upstream source, used only for logging
    pub offset: i64,
    /// event time of the message, assigned by the producer
    pub event_time: DateTime<Utc>,
    /// watermark observed when the message arrived
    pub watermark: Option<DateTime<Utc>>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            typ: Default::default(),
            value: Bytes::new(),
            attributes: Arc::new(HashMap::new()),
            offset: 0,
            event_time: Utc::now(),
            watermark: None,
        }
    }
}

impl Message {
    /// Creates a watermark barrier, a control message that advances the watermark of
    /// every shard without carrying data.
    pub fn wmb(watermark: DateTime<Utc>) -> Self {
        Self {
            typ: MessageType::WMB,
            watermark: Some(watermark),
            ..Default::default()
        }
    }
}

/// Type of the [Message].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// the payload is Data
    #[default]
    Data,
    /// the payload is a control message advancing the watermark
    #[allow(clippy::upper_case_acronyms)]
    WMB,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Data => write!(f, "Data"),
            MessageType::WMB => write!(f, "WMB"),
        }
    }
}

/// The opaque byte identifier a message is deduplicated on. Two keys are the same
/// exactly when their bytes are the same; no canonicalization is applied. Keys are
/// typically 16-byte UUIDs stamped by the producer, but any length is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(Bytes);

impl DedupKey {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random 16-byte key, for producers stamping outgoing
    /// messages.
    pub fn random() -> Self {
        Self(Bytes::copy_from_slice(Uuid::new_v4().as_bytes()))
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl From<Bytes> for DedupKey {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Uuid> for DedupKey {
    fn from(uuid: Uuid) -> Self {
        Self(Bytes::copy_from_slice(uuid.as_bytes()))
    }
}

impl AsRef<[u8]> for DedupKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 16-byte keys read better in logs as UUIDs, everything else as hex
        match Uuid::from_slice(&self.0) {
            Ok(uuid) => write!(f, "{uuid}"),
            Err(_) => {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A message that could not enter the dedup pipeline, delivered on the failed stream
/// together with the error that rejected it.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub message: Message,
    pub error: Error,
}
