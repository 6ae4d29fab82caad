//! Payload codec seam.
//!
//! Leaf payloads are opaque to the tree core: the engine never inspects
//! payload bytes beyond their size. Anything that needs to move a payload
//! through a byte stream (node persistence, diagnostics) goes through a
//! [`PayloadCodec`] supplied by the consumer.

use crate::error::Result;

/// Opaque serialize/deserialize of leaf payload values.
pub trait PayloadCodec<V> {
    /// Appends the encoding of `value` to `out`.
    fn encode(&self, value: &V, out: &mut Vec<u8>) -> Result<()>;

    /// Decodes one value from `bytes` (the exact slice produced by
    /// [`encode`](Self::encode)).
    fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// Identity codec for raw byte payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl PayloadCodec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
