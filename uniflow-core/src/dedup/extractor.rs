//! Pulls the dedup key out of a [Message]. The default extractor reads the key from
//! a well-known attribute, the way producers using [DedupKey::random] are expected
//! to stamp it. Callers with their own envelope plug in a custom [KeyExtractor];
//! extraction must be pure so that redeliveries of the same message always yield
//! the same key.

use crate::Error;
use crate::Result;
use crate::message::{DedupKey, Message};

/// The attribute the default extractor reads the dedup key from.
pub const DEFAULT_KEY_ATTRIBUTE: &str = "x-uniflow-dedup-id";

/// Extracts the dedup key from a message. Implementations must be deterministic:
/// the same message always maps to the same key, across retries and across
/// processes.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, message: &Message) -> Result<DedupKey>;
}

/// Any `Fn(&Message) -> Result<DedupKey>` can act as the extractor.
impl<F> KeyExtractor for F
where
    F: Fn(&Message) -> Result<DedupKey> + Send + Sync,
{
    fn extract(&self, message: &Message) -> Result<DedupKey> {
        self(message)
    }
}

/// The default extractor: reads the key from a message attribute and insists on
/// exactly one value being present. Zero values means the producer never stamped the
/// message; more than one means the attribute is ambiguous. Both are permanent
/// per-message failures.
#[derive(Debug, Clone)]
pub struct AttributeExtractor {
    attribute: String,
}

impl AttributeExtractor {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl Default for AttributeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_ATTRIBUTE)
    }
}

impl KeyExtractor for AttributeExtractor {
    fn extract(&self, message: &Message) -> Result<DedupKey> {
        let values = message.attributes.get(&self.attribute).ok_or_else(|| {
            Error::MissingKey(format!(
                "attribute {} is not present in the message attributes",
                self.attribute
            ))
        })?;
        match values.as_slice() {
            [value] => Ok(DedupKey::new(value.clone())),
            _ => Err(Error::MissingKey(format!(
                "attribute {} must carry exactly one value, found {}",
                self.attribute,
                values.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;

    fn message_with_attribute(attribute: &str, values: Vec<Bytes>) -> Message {
        Message {
            attributes: Arc::new(HashMap::from([(attribute.to_string(), values)])),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_single_valued_attribute() {
        let key = DedupKey::random();
        let message =
            message_with_attribute(DEFAULT_KEY_ATTRIBUTE, vec![key.as_bytes().clone()]);

        let extracted = AttributeExtractor::default().extract(&message).unwrap();
        assert_eq!(extracted, key);
    }

    #[test]
    fn missing_attribute_is_rejected() {
        let message = Message::default();
        let result = AttributeExtractor::default().extract(&message);
        assert!(matches!(result, Err(Error::MissingKey(_))));
    }

    #[test]
    fn multi_valued_attribute_is_rejected() {
        let message = message_with_attribute(
            DEFAULT_KEY_ATTRIBUTE,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")],
        );
        let result = AttributeExtractor::default().extract(&message);
        assert!(matches!(result, Err(Error::MissingKey(_))));
    }

    #[test]
    fn custom_attribute_name() {
        let key = DedupKey::random();
        let message = message_with_attribute("trace-id", vec![key.as_bytes().clone()]);

        let extracted = AttributeExtractor::new("trace-id")
            .extract(&message)
            .unwrap();
        assert_eq!(extracted, key);
    }

    #[test]
    fn closures_act_as_extractors() {
        let extractor =
            |message: &Message| -> Result<DedupKey> { Ok(DedupKey::new(message.value.clone())) };
        let message = Message {
            value: Bytes::from_static(b"payload-as-key"),
            ..Default::default()
        };

        let extracted = extractor.extract(&message).unwrap();
        assert_eq!(extracted.as_ref(), b"payload-as-key");
    }
}
