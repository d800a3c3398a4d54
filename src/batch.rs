//! Size-bounded message accumulator. Messages are encoded exactly once on
//! entry; the payload for the ingest endpoint is assembled from the raw
//! encodings.

use serde::Serialize;
use serde_json::value::RawValue;

use crate::message::Message;

/// Maximum encoded size of the batch array, in bytes.
pub(crate) const MAX_BATCH_BYTES: usize = 500_000;
/// Maximum encoded size of a single message, in bytes.
pub(crate) const MAX_MESSAGE_BYTES: usize = 32_768;

/// Outcome of [`MessageBatch::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchAdd {
    /// The message was accepted.
    Added,
    /// Accepting the message would exceed the count or byte limit; flush
    /// first, then retry.
    BatchFull,
    /// The message alone exceeds the per-message limit and can never be
    /// delivered.
    MessageTooLarge { bytes: usize },
}

#[derive(Serialize)]
struct BatchPayload<'a> {
    api_key: &'a str,
    batch: &'a [Box<RawValue>],
}

pub(crate) struct MessageBatch {
    max_count: usize,
    encoded: Vec<Box<RawValue>>,
    // Encoded byte size of the batch array, including the surrounding [].
    bytes: usize,
}

impl MessageBatch {
    pub fn new(max_count: usize) -> Self {
        MessageBatch {
            max_count,
            encoded: Vec::new(),
            bytes: 2,
        }
    }

    pub fn add(&mut self, message: &Message) -> BatchAdd {
        // Message serialization only produces JSON-representable values,
        // so encoding does not fail.
        let encoded =
            serde_json::to_string(message).expect("message serialization does not fail");
        let size = encoded.len();
        if size > MAX_MESSAGE_BYTES {
            return BatchAdd::MessageTooLarge { bytes: size };
        }
        // One byte for the separating comma when not the first element.
        let separator = usize::from(!self.encoded.is_empty());
        if self.encoded.len() + 1 > self.max_count
            || self.bytes + size + separator > MAX_BATCH_BYTES
        {
            return BatchAdd::BatchFull;
        }
        self.bytes += size + separator;
        self.encoded.push(
            RawValue::from_string(encoded).expect("encoded message is valid JSON"),
        );
        BatchAdd::Added
    }

    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    /// `true` once the batch cannot be expected to take another message.
    pub fn full(&self) -> bool {
        self.encoded.len() >= self.max_count || self.bytes >= MAX_BATCH_BYTES
    }

    pub fn clear(&mut self) {
        self.encoded.clear();
        self.bytes = 2;
    }

    /// Serialized request body for the ingest endpoint.
    pub fn payload(&self, api_key: &str) -> String {
        serde_json::to_string(&BatchPayload {
            api_key,
            batch: &self.encoded,
        })
        .expect("batch payload serialization does not fail")
    }
}
