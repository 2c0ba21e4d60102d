// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM response framing.
//!
//! The backend speaks a header-then-body framed protocol: every response
//! starts with a fixed-size TPM 2.0 response header whose `size` field
//! declares the length of the whole frame, header included. The field is
//! big-endian, per the TPM wire convention. The declared size arrives over
//! the channel and is treated as untrusted length data.

pub use packed_nums::*;

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

/// TPM 2.0 response header.
#[repr(C)]
#[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ResponseHeader {
    pub session_tag: u16_be,
    pub size: u32_be,
    pub response_code: u32_be,
}

pub const RESPONSE_HEADER_SIZE: usize = size_of::<ResponseHeader>();

impl ResponseHeader {
    pub fn read(bytes: &[u8; RESPONSE_HEADER_SIZE]) -> &Self {
        zerocopy::transmute_ref!(bytes)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("declared response size {size:#x} is smaller than the response header")]
    MalformedHeader { size: u32 },
    #[error("declared response size {size:#x} exceeds the response buffer capacity {capacity:#x}")]
    ResponseTooLarge { size: u32, capacity: u32 },
}

/// Decides how many bytes complete a response, given the header already
/// read from the channel.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn header_size(&self) -> usize {
        RESPONSE_HEADER_SIZE
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Validates the declared total frame size against the header size and
    /// the guest's response buffer capacity.
    ///
    /// The declared size is used as is; the completed response length is
    /// exactly this value, with no offset adjustment.
    pub fn total_size(
        &self,
        header: &ResponseHeader,
        buffer_capacity: u32,
    ) -> Result<u32, FrameError> {
        let size = header.size.get();
        if (size as usize) < RESPONSE_HEADER_SIZE {
            return Err(FrameError::MalformedHeader { size });
        }
        let capacity = self.max_frame_size.min(buffer_capacity);
        if size > capacity {
            return Err(FrameError::ResponseTooLarge { size, capacity });
        }
        Ok(size)
    }
}
