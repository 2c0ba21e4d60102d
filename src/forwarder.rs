// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The request forwarding state machine.
//!
//! One element at a time: pop, validate the descriptor geometry, send the
//! command bytes to the backend, read the framed response (header, then the
//! header-declared body), write it into the guest's response segments, and
//! complete the element. Every popped element is completed on every path,
//! including all error paths; a dropped element would permanently starve
//! the guest driver.
//!
//! The backend's declared response size arrives over the channel and is
//! validated against the guest buffer capacity before any read targets the
//! buffer. Once a channel or framing error occurs the stream position can
//! no longer be trusted, so the forwarder latches a fault and rejects
//! further requests until the device lifecycle resets it with a fresh
//! connection.

use crate::backend::ChannelError;
use crate::backend::TpmBackend;
use crate::mem::GuestMemory;
use crate::mem::GuestMemoryError;
use crate::mem::ResponseBuffer;
use crate::mem::ResponseBufferError;
use crate::protocol::FrameCodec;
use crate::protocol::FrameError;
use crate::protocol::ResponseHeader;
use crate::protocol::RESPONSE_HEADER_SIZE;
use crate::queue::TpmQueueElement;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::IntoBytes;

#[derive(Debug, Error)]
pub enum TpmRequestError {
    #[error("request descriptor chain is missing a readable or writeable segment")]
    MalformedRequest,
    #[error("request of {length} bytes exceeds the maximum command size {max}")]
    RequestTooLarge { length: u64, max: u32 },
    #[error("failed to read the command from guest memory")]
    Memory(#[from] GuestMemoryError),
    #[error("TPM backend channel failed")]
    Channel(#[from] ChannelError),
    #[error("TPM backend response framing error")]
    Frame(#[from] FrameError),
    #[error("failed to write the response into guest memory")]
    ResponseBuffer(#[from] ResponseBufferError),
    #[error("TPM backend channel is unusable after an earlier failure")]
    ChannelFaulted,
}

impl TpmRequestError {
    /// Guest-side validation failures leave the channel untouched and are
    /// recovered per request; everything else desynchronizes the stream.
    fn faults_channel(&self) -> bool {
        !matches!(
            self,
            TpmRequestError::MalformedRequest
                | TpmRequestError::RequestTooLarge { .. }
                | TpmRequestError::Memory(_)
                | TpmRequestError::ChannelFaulted
        )
    }
}

/// Forwards guest TPM commands to the backend and returns the framed
/// responses through the queue.
///
/// The backend handle is an explicit dependency injected at construction
/// and exclusively owned; processing takes `&mut self`, so two invocations
/// cannot overlap on the same channel.
pub struct TpmRequestForwarder {
    backend: Box<dyn TpmBackend>,
    mem: Arc<dyn GuestMemory>,
    codec: FrameCodec,
    faulted: bool,
}

impl TpmRequestForwarder {
    pub fn new(
        backend: Box<dyn TpmBackend>,
        mem: Arc<dyn GuestMemory>,
        max_frame_size: u32,
    ) -> Self {
        Self {
            backend,
            mem,
            codec: FrameCodec::new(max_frame_size),
            faulted: false,
        }
    }

    /// True once a channel or framing error has made the connection
    /// unusable.
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Replaces the backend connection and clears the fault latch. Called
    /// by the surrounding device lifecycle after reconnecting.
    pub fn reset(&mut self, backend: Box<dyn TpmBackend>) {
        self.backend = backend;
        self.faulted = false;
    }

    /// Handles one popped queue element.
    ///
    /// The element is always completed before returning: with the decoded
    /// total response size on success, with a zero-length response on any
    /// failure.
    pub fn process_element(
        &mut self,
        mut element: TpmQueueElement,
    ) -> Result<(), TpmRequestError> {
        match self.forward(&element) {
            Ok(response_len) => {
                element.complete(response_len);
                Ok(())
            }
            Err(err) => {
                if err.faults_channel() {
                    self.faulted = true;
                }
                element.complete(0);
                Err(err)
            }
        }
    }

    fn forward(&mut self, element: &TpmQueueElement) -> Result<u32, TpmRequestError> {
        if self.faulted {
            return Err(TpmRequestError::ChannelFaulted);
        }

        let request_len = element.payload_length(false);
        let response_buffer = ResponseBuffer::new(self.mem.as_ref(), &element.payload);
        if request_len == 0 || response_buffer.capacity() == 0 {
            return Err(TpmRequestError::MalformedRequest);
        }
        if request_len > self.codec.max_frame_size() as u64 {
            return Err(TpmRequestError::RequestTooLarge {
                length: request_len,
                max: self.codec.max_frame_size(),
            });
        }

        let mut command = vec![0; request_len as usize];
        let read = element.read(self.mem.as_ref(), &mut command)?;

        tracing::trace!(
            descriptor_index = element.descriptor_index(),
            request_len = read,
            response_capacity = response_buffer.capacity(),
            "sending TPM command"
        );
        self.backend.channel().write_all(&command[..read])?;

        let mut header_bytes = [0; RESPONSE_HEADER_SIZE];
        self.backend.channel().read_exact(&mut header_bytes)?;
        let header = ResponseHeader::read(&header_bytes);
        let total_size = self
            .codec
            .total_size(header, response_buffer.capacity())?;

        tracing::trace!(
            session_tag = header.session_tag.get(),
            response_code = header.response_code.get(),
            total_size,
            "TPM response header"
        );

        response_buffer.write_at(0, header.as_bytes())?;
        let body_len = total_size as usize - RESPONSE_HEADER_SIZE;
        if body_len > 0 {
            let mut body = vec![0; body_len];
            self.backend.channel().read_exact(&mut body)?;
            response_buffer.write_at(RESPONSE_HEADER_SIZE as u32, &body)?;
        }

        tracing::trace!(total_size, "TPM response complete");
        Ok(total_size)
    }
}
