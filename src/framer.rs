//! Chunk framing and reassembly.
//!
//! Framing is pure arithmetic over the snapshot bytes: chunk `i` covers
//! `i*chunk_size .. min((i+1)*chunk_size, len)`. Reassembly is slot-based:
//! the index is authoritative, the first arrival for a slot wins and later
//! duplicates are ignored.

use crate::error::{Result, SyncError};
use crate::protocol::{MapChunk, MapTransferBegin};
use bytes::{Bytes, BytesMut};
use std::ops::Range;

/// Number of chunks needed for `len` bytes. An empty payload is still sent
/// as a single empty chunk so every transfer has something to complete on.
pub fn chunk_count(len: usize, chunk_size: usize) -> u32 {
    if len == 0 {
        return 1;
    }
    len.div_ceil(chunk_size) as u32
}

pub fn chunk_range(index: u32, chunk_size: usize, len: usize) -> Range<usize> {
    let start = (index as usize * chunk_size).min(len);
    let end = ((index as usize + 1) * chunk_size).min(len);
    start..end
}

/// Build chunk `index` of `bytes`. The payload shares `bytes`' allocation.
pub fn chunk_at(transfer_id: &str, bytes: &Bytes, chunk_size: usize, index: u32) -> MapChunk {
    let total = chunk_count(bytes.len(), chunk_size);
    MapChunk {
        transfer_id: transfer_id.to_string(),
        chunk_index: index as i32,
        total_chunks: total as i32,
        payload: bytes.slice(chunk_range(index, chunk_size, bytes.len())),
    }
}

/// Split `bytes` into its ordered chunk sequence.
pub fn frame(transfer_id: &str, bytes: &Bytes, chunk_size: usize) -> Vec<MapChunk> {
    (0..chunk_count(bytes.len(), chunk_size))
        .map(|i| chunk_at(transfer_id, bytes, chunk_size, i))
        .collect()
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Outcome of feeding one chunk into a [`ChunkAssembly`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyStatus {
    /// Slot filled; more chunks are needed.
    Pending { received: u32, total: u32 },
    /// Slot already filled, or the assembly already completed. No state change.
    Ignored,
    /// Last slot filled. Carries the concatenated bytes in index order.
    Complete(Bytes),
}

/// Receiver-owned reassembly buffer for one transfer.
#[derive(Debug)]
pub struct ChunkAssembly {
    transfer_id: String,
    total_chunks: u32,
    expected_size: Option<u64>,
    slots: Vec<Option<Bytes>>,
    filled: u32,
    completed: bool,
}

impl ChunkAssembly {
    pub fn new(transfer_id: impl Into<String>, total_chunks: u32) -> Result<Self> {
        if total_chunks == 0 {
            return Err(SyncError::EmptyTransfer);
        }
        Ok(Self {
            transfer_id: transfer_id.into(),
            total_chunks,
            expected_size: None,
            slots: vec![None; total_chunks as usize],
            filled: 0,
            completed: false,
        })
    }

    /// Assembly for an announced transfer. Every chunk carries at least one
    /// byte except the single chunk of an empty world, so a begin claiming
    /// more chunks than bytes is rejected before any slot is allocated.
    pub fn for_begin(begin: &MapTransferBegin) -> Result<Self> {
        let implausible = || SyncError::ImplausibleBegin {
            transfer_id: begin.transfer_id.clone(),
            total_chunks: begin.total_chunks as i64,
            total_size_bytes: begin.total_size_bytes,
        };
        if begin.total_chunks <= 0 || begin.total_size_bytes < 0 {
            return Err(implausible());
        }
        if begin.total_chunks as i64 > begin.total_size_bytes.max(1) {
            return Err(implausible());
        }
        Ok(Self::new(begin.transfer_id.clone(), begin.total_chunks as u32)?
            .with_expected_size(begin.total_size_bytes as u64))
    }

    /// Also verify the reassembled length against the announced size.
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn total(&self) -> u32 {
        self.total_chunks
    }

    pub fn received(&self) -> u32 {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Fraction of slots filled, in `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        self.filled as f32 / self.total_chunks as f32
    }

    pub fn accept(&mut self, chunk: &MapChunk) -> Result<AssemblyStatus> {
        if chunk.transfer_id != self.transfer_id {
            return Err(SyncError::TransferMismatch {
                expected: self.transfer_id.clone(),
                got: chunk.transfer_id.clone(),
            });
        }
        if chunk.total_chunks < 0 || chunk.total_chunks as u32 != self.total_chunks {
            return Err(SyncError::ChunkCountMismatch {
                transfer_id: self.transfer_id.clone(),
                expected: self.total_chunks,
                got: chunk.total_chunks.max(0) as u32,
            });
        }
        if chunk.chunk_index < 0 || chunk.chunk_index as u32 >= self.total_chunks {
            return Err(SyncError::ChunkOutOfRange {
                transfer_id: self.transfer_id.clone(),
                index: chunk.chunk_index.max(0) as u32,
                total_chunks: self.total_chunks,
            });
        }
        if self.completed {
            return Ok(AssemblyStatus::Ignored);
        }

        let slot = &mut self.slots[chunk.chunk_index as usize];
        if slot.is_some() {
            return Ok(AssemblyStatus::Ignored);
        }
        *slot = Some(chunk.payload.clone());
        self.filled += 1;

        if self.filled < self.total_chunks {
            return Ok(AssemblyStatus::Pending {
                received: self.filled,
                total: self.total_chunks,
            });
        }

        let bytes = self.concat();
        self.completed = true;
        if let Some(expected) = self.expected_size {
            if bytes.len() as u64 != expected {
                return Err(SyncError::SizeMismatch {
                    expected,
                    actual: bytes.len() as u64,
                });
            }
        }
        Ok(AssemblyStatus::Complete(bytes))
    }

    /// Concatenate slots in index order and release them.
    fn concat(&mut self) -> Bytes {
        let len = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for payload in self.slots.iter_mut().filter_map(Option::take) {
            out.extend_from_slice(&payload);
        }
        out.freeze()
    }
}
