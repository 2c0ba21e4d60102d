// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory access boundary and the bounds-checked response view.
//!
//! The platform owns the actual guest address space mapping; this crate only
//! sees it through [`GuestMemory`]. Response bytes from the TPM backend are
//! written through [`ResponseBuffer`], which never exposes an address to the
//! caller and refuses any write that would cross the capacity the guest
//! declared for its response segments.

use crate::queue::QueuePayload;
use thiserror::Error;

/// A guest memory access failed.
#[derive(Debug, Error)]
#[error("guest memory access failed at {address:#x} ({length} bytes)")]
pub struct GuestMemoryError {
    pub address: u64,
    pub length: usize,
}

/// Scatter/gather access to guest physical memory, provided by the platform.
pub trait GuestMemory: Send + Sync {
    fn read_at(&self, address: u64, data: &mut [u8]) -> Result<(), GuestMemoryError>;
    fn write_at(&self, address: u64, data: &[u8]) -> Result<(), GuestMemoryError>;
}

#[derive(Debug, Error)]
pub enum ResponseBufferError {
    #[error("write of {length} bytes at offset {offset} exceeds response buffer capacity {capacity}")]
    OutOfBounds {
        offset: u32,
        length: usize,
        capacity: u32,
    },
    #[error("error accessing response buffer memory")]
    Memory(#[source] GuestMemoryError),
}

/// Bounds-checked view over the device-writeable segments of a queue element.
///
/// The capacity is the total length the guest declared for its writeable
/// segments. The backend's declared response size is untrusted, so every
/// write is checked against the capacity before any memory is touched.
pub struct ResponseBuffer<'a> {
    mem: &'a dyn GuestMemory,
    segments: Vec<&'a QueuePayload>,
    capacity: u32,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(mem: &'a dyn GuestMemory, payload: &'a [QueuePayload]) -> Self {
        let segments: Vec<_> = payload.iter().filter(|p| p.writeable).collect();
        let capacity = segments
            .iter()
            .fold(0u64, |acc, p| acc + p.length as u64)
            .min(u32::MAX as u64) as u32;
        Self {
            mem,
            segments,
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Writes `data` at `offset` within the guest's response segments,
    /// spanning segment boundaries as needed.
    pub fn write_at(&self, offset: u32, data: &[u8]) -> Result<(), ResponseBufferError> {
        if data.is_empty() {
            return Ok(());
        }
        if offset as u64 + data.len() as u64 > self.capacity as u64 {
            return Err(ResponseBufferError::OutOfBounds {
                offset,
                length: data.len(),
                capacity: self.capacity,
            });
        }

        let mut skip_bytes = offset as u64;
        let mut remaining = data;
        for payload in &self.segments {
            let payload_length = payload.length as u64;
            if skip_bytes >= payload_length {
                skip_bytes -= payload_length;
                continue;
            }

            let size = std::cmp::min(
                (payload_length - skip_bytes) as usize,
                remaining.len(),
            );
            let (current, next) = remaining.split_at(size);
            self.mem
                .write_at(payload.address + skip_bytes, current)
                .map_err(ResponseBufferError::Memory)?;
            remaining = next;
            if remaining.is_empty() {
                break;
            }
            skip_bytes = 0;
        }

        // The capacity check above guarantees the segment walk consumed
        // everything.
        debug_assert!(remaining.is_empty());
        Ok(())
    }
}
