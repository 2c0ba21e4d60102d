// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Byte-stream channel to the TPM emulation process.
//!
//! The channel carries no framing of its own; the forwarder drives it
//! through the frame codec. `read_exact` consumes bytes irreversibly, so a
//! failure after partial consumption leaves the stream in an indeterminate
//! framing state. Callers must treat any channel error as fatal to the
//! connection rather than attempt to resynchronize.

use std::io;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to write command bytes to the TPM backend")]
    Write(#[source] io::Error),
    #[error("failed to read response bytes from the TPM backend")]
    Read(#[source] io::Error),
    #[error("the TPM backend closed the connection")]
    Disconnected,
}

/// Duplex byte stream to the backend.
pub trait FramedChannel: Send {
    /// Writes every byte of `data` or fails; no partial success is
    /// reported.
    fn write_all(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Blocks until `data` is filled entirely or the channel fails.
    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), ChannelError>;
}

/// [`FramedChannel`] over any connected byte stream.
pub struct StreamChannel<T> {
    stream: T,
}

impl<T> StreamChannel<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }
}

impl<T: Read + Write + Send> FramedChannel for StreamChannel<T> {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.stream.write_all(data).map_err(ChannelError::Write)?;
        self.stream.flush().map_err(ChannelError::Write)
    }

    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), ChannelError> {
        self.stream.read_exact(data).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                ChannelError::Disconnected
            } else {
                ChannelError::Read(err)
            }
        })
    }
}

/// A TPM emulation backend reachable over a [`FramedChannel`].
///
/// The channel accessor is part of the public contract so that the
/// forwarder never needs to assume a concrete backend variant.
pub trait TpmBackend: Send {
    fn channel(&mut self) -> &mut dyn FramedChannel;
}

/// Backend connected over a Unix domain socket, the usual transport to a
/// swtpm-style emulation process.
#[cfg(unix)]
pub struct SocketTpmBackend {
    channel: StreamChannel<UnixStream>,
}

#[cfg(unix)]
impl SocketTpmBackend {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            channel: StreamChannel::new(stream),
        }
    }

    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(UnixStream::connect(path)?))
    }
}

#[cfg(unix)]
impl TpmBackend for SocketTpmBackend {
    fn channel(&mut self) -> &mut dyn FramedChannel {
        &mut self.channel
    }
}
