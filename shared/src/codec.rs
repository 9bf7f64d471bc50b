//! Batch codec for pooled broadcasts.
//!
//! A flushed pool becomes one binary block: the events are framed with `bincode`
//! and the frame is compressed with LZ4. RPC arguments are opaque JSON, so they ride
//! inside the frame as JSON text. Event order is preserved.

use crate::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame serialization failed: {0}")]
    Frame(#[from] bincode::Error),
    #[error("argument encoding failed: {0}")]
    Args(#[from] serde_json::Error),
    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
}

/// Turns an ordered batch of events into one binary block and back.
pub trait PacketCodec: Send + Sync {
    fn encode(&self, events: &[Event]) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Event>, CodecError>;
}

#[derive(Serialize, Deserialize)]
struct FrameEvent {
    class: String,
    method: String,
    args_json: String,
    entity_id: Option<String>,
    lobby_id: Option<String>,
    timestamp: u64,
}

/// `bincode` frame compressed with size-prepended LZ4.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl PacketCodec for Lz4Codec {
    fn encode(&self, events: &[Event]) -> Result<Vec<u8>, CodecError> {
        let frame = events
            .iter()
            .map(|event| {
                Ok(FrameEvent {
                    class: event.origin_class.clone(),
                    method: event.method.clone(),
                    args_json: serde_json::to_string(&event.args)?,
                    entity_id: event.entity_id.clone(),
                    lobby_id: event.lobby_id.clone(),
                    timestamp: event.timestamp,
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;

        let raw = bincode::serialize(&frame)?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Event>, CodecError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)?;
        let frame: Vec<FrameEvent> = bincode::deserialize(&raw)?;

        frame
            .into_iter()
            .map(|f| {
                Ok(Event {
                    origin_class: f.class,
                    method: f.method,
                    args: serde_json::from_str(&f.args_json)?,
                    entity_id: f.entity_id,
                    lobby_id: f.lobby_id,
                    timestamp: f.timestamp,
                })
            })
            .collect()
    }
}
