//! Out-of-band shared buffers for large payloads.
//!
//! Envelopes carry an [`AttachmentRef`] instead of inlining large binary data;
//! the bytes live here until the last holder releases them.

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{BufferId, Error, IdAllocator, Result};

/// Reference to a shared buffer carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub buffer_id: BufferId,
    pub len: u64,
}

/// Registry of shared buffers, keyed by [`BufferId`].
#[derive(Debug, Default)]
pub struct SharedBuffers {
    buffers: DashMap<BufferId, Bytes>,
    ids: IdAllocator,
    resident_bytes: AtomicU64,
}

impl SharedBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes and return the reference to attach to an envelope.
    pub fn put(&self, data: impl Into<Bytes>) -> AttachmentRef {
        let data = data.into();
        let id: BufferId = self.ids.next();
        let len = data.len() as u64;
        self.buffers.insert(id, data);
        self.resident_bytes.fetch_add(len, Ordering::Relaxed);
        tracing::trace!(buffer_id = %id, len, "shared buffer stored");
        AttachmentRef { buffer_id: id, len }
    }

    /// Cheap clone of the buffer contents.
    pub fn get(&self, attachment: &AttachmentRef) -> Result<Bytes> {
        self.buffers
            .get(&attachment.buffer_id)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::not_found(format!("shared buffer {}", attachment.buffer_id)))
    }

    /// Up to `max_len` bytes starting at `offset`, with the buffer's total length.
    pub fn read(&self, buffer_id: BufferId, offset: u64, max_len: usize) -> Result<(Bytes, u64)> {
        let data = self
            .buffers
            .get(&buffer_id)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::not_found(format!("shared buffer {}", buffer_id)))?;
        let total = data.len() as u64;
        if offset > total {
            return Err(Error::validation(format!(
                "offset {} past the end of shared buffer {} ({} bytes)",
                offset, buffer_id, total
            )));
        }
        // offset <= total, which came from a usize.
        let start = offset as usize;
        let end = start.saturating_add(max_len).min(data.len());
        Ok((data.slice(start..end), total))
    }

    /// Drop the registry's reference. Outstanding `Bytes` clones stay valid.
    pub fn release(&self, attachment: &AttachmentRef) -> bool {
        match self.buffers.remove(&attachment.buffer_id) {
            Some((_, data)) => {
                self.resident_bytes
                    .fetch_sub(data.len() as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_release() {
        let buffers = SharedBuffers::new();
        let attachment = buffers.put(vec![7u8; 4096]);
        assert_eq!(attachment.len, 4096);
        assert_eq!(buffers.resident_bytes(), 4096);

        let data = buffers.get(&attachment).unwrap();
        assert_eq!(data.len(), 4096);

        assert!(buffers.release(&attachment));
        assert!(!buffers.release(&attachment));
        assert_eq!(buffers.resident_bytes(), 0);
        // Clone taken before release survives it.
        assert_eq!(data[0], 7);
        assert!(buffers.get(&attachment).is_err());
    }

    #[test]
    fn test_read_in_chunks() {
        let buffers = SharedBuffers::new();
        let attachment = buffers.put(b"abcdefghij".to_vec());

        let (first, total) = buffers.read(attachment.buffer_id, 0, 4).unwrap();
        assert_eq!((&first[..], total), (&b"abcd"[..], 10));
        let (last, _) = buffers.read(attachment.buffer_id, 8, 4).unwrap();
        assert_eq!(&last[..], b"ij");
        let (empty, _) = buffers.read(attachment.buffer_id, 10, 4).unwrap();
        assert!(empty.is_empty());

        assert!(matches!(
            buffers.read(attachment.buffer_id, 11, 4),
            Err(Error::Validation(_))
        ));
        buffers.release(&attachment);
        assert!(matches!(
            buffers.read(attachment.buffer_id, 0, 4),
            Err(Error::NotFound(_))
        ));
    }
}
