//! Wire codec and delivery channel contracts.
//!
//! The distributor hands each chunk to a [`PayloadCodec`] and sends the bytes
//! on a [`DeliveryChannel`] obtained from a [`ChannelProvider`]. Connection
//! pooling and the exchange format live behind these traits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::model::{IdPolicy, Payload};

use super::target::ChannelPolicy;

/// Maximum size of one encoded chunk.
pub const MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Who a chunk is for and where it sits in its delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryContext {
    /// Unique per chunk, so consumers can detect duplicates.
    pub message_id: Uuid,
    pub target_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    pub id_policy: IdPolicy,
    /// Zero-based.
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub produced_at: DateTime<Utc>,
}

/// Encodes an outbound chunk.
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, payload: &Payload, context: &DeliveryContext) -> Result<Vec<u8>, DeliveryError>;
}

/// A connection to one consumer address.
pub trait DeliveryChannel: Send + Sync {
    fn send(&self, bytes: &[u8], timeout: Duration) -> Result<(), DeliveryError>;

    /// Releases the channel. Called when a send fails or the channel is evicted.
    fn close(&self) {}
}

/// Creates channels bound to consumer addresses.
pub trait ChannelProvider: Send + Sync {
    fn channel(&self, address: &str, policy: ChannelPolicy) -> Result<Arc<dyn DeliveryChannel>, DeliveryError>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    context: &'a DeliveryContext,
    payload: &'a Payload,
}

/// JSON envelope codec: the delivery context fields next to a `payload` object.
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec {
    max_bytes: usize,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            max_bytes: MAX_CHUNK_BYTES,
        }
    }
}

impl JsonCodec {
    #[must_use]
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl PayloadCodec for JsonCodec {
    fn encode(&self, payload: &Payload, context: &DeliveryContext) -> Result<Vec<u8>, DeliveryError> {
        let bytes = serde_json::to_vec(&Envelope { context, payload }).map_err(|e| DeliveryError::Encoding {
            message: format!("failed to serialize chunk: {e}"),
        })?;
        if bytes.len() > self.max_bytes {
            return Err(DeliveryError::Encoding {
                message: format!(
                    "chunk {} of {} for '{}' is {} bytes, limit {}",
                    context.chunk_index + 1,
                    context.chunk_count,
                    context.target_id,
                    bytes.len(),
                    self.max_bytes
                ),
            });
        }
        Ok(bytes)
    }
}
