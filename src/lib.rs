// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtio TPM device.
//!
//! Forwards TPM command buffers submitted by the guest through a single
//! virtio queue to an external TPM emulation process over a byte-stream
//! channel, and returns the framed responses through the same queue
//! elements. The transport binding, descriptor ring machinery, and the TPM
//! emulator itself are external collaborators; this crate implements the
//! forwarding path between them.

#![forbid(unsafe_code)]

pub mod backend;
pub mod forwarder;
pub mod mem;
pub mod protocol;
pub mod queue;

use crate::backend::TpmBackend;
use crate::forwarder::TpmRequestForwarder;
use crate::mem::GuestMemory;
use crate::queue::QueueWorkerContext;
use crate::queue::TpmQueueElement;
use async_trait::async_trait;
use std::sync::Arc;

/// The device exposes one request queue.
pub const TPM_QUEUE_COUNT: u16 = 1;
pub const TPM_QUEUE_SIZE: u16 = 8;

/// Maximum TPM command/response frame size, one command buffer page.
pub const TPM_MAX_FRAME_SIZE: u32 = 4096;

/// The virtio TPM device: owns the forwarder and plugs it into the
/// platform's queue worker loop.
pub struct TpmDevice {
    forwarder: TpmRequestForwarder,
}

impl TpmDevice {
    pub fn new(backend: Box<dyn TpmBackend>, mem: Arc<dyn GuestMemory>) -> Self {
        Self {
            forwarder: TpmRequestForwarder::new(backend, mem, TPM_MAX_FRAME_SIZE),
        }
    }

    /// Access for the device lifecycle, e.g. to reset the backend channel
    /// after a fault.
    pub fn forwarder_mut(&mut self) -> &mut TpmRequestForwarder {
        &mut self.forwarder
    }
}

#[async_trait]
impl QueueWorkerContext for TpmDevice {
    async fn process_work(&mut self, work: anyhow::Result<TpmQueueElement>) -> bool {
        let element = match work {
            Ok(element) => element,
            Err(err) => {
                tracing::error!(err = err.as_ref() as &dyn std::error::Error, "queue error");
                return false;
            }
        };
        match self.forwarder.process_element(element) {
            Ok(()) => true,
            Err(err) if self.forwarder.is_faulted() => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "TPM backend channel failed, stopping queue processing"
                );
                false
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "dropped malformed TPM request"
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FramedChannel;
    use crate::backend::StreamChannel;
    use crate::mem::GuestMemoryError;
    use crate::queue::CompletionNotifier;
    use crate::queue::QueuePayload;
    use futures::executor::block_on;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::io::Read;
    use std::io::Write;

    struct TestMemory(Mutex<Vec<u8>>);

    impl GuestMemory for TestMemory {
        fn read_at(&self, address: u64, data: &mut [u8]) -> Result<(), GuestMemoryError> {
            let mem = self.0.lock();
            let start = address as usize;
            let range = mem.get(start..start + data.len()).ok_or(GuestMemoryError {
                address,
                length: data.len(),
            })?;
            data.copy_from_slice(range);
            Ok(())
        }

        fn write_at(&self, address: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
            let mut mem = self.0.lock();
            let start = address as usize;
            let range = mem
                .get_mut(start..start + data.len())
                .ok_or(GuestMemoryError {
                    address,
                    length: data.len(),
                })?;
            range.copy_from_slice(data);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct TestStream {
        inner: Arc<Mutex<(Vec<u8>, VecDeque<u8>)>>,
    }

    impl Read for TestStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock();
            let count = buf.len().min(inner.1.len());
            for b in buf[..count].iter_mut() {
                *b = inner.1.pop_front().unwrap();
            }
            Ok(count)
        }
    }

    impl Write for TestStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.lock().0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct TestBackend {
        channel: StreamChannel<TestStream>,
    }

    impl TpmBackend for TestBackend {
        fn channel(&mut self) -> &mut dyn FramedChannel {
            &mut self.channel
        }
    }

    #[derive(Default)]
    struct TestNotifier {
        completions: Vec<(u16, u32)>,
    }

    impl CompletionNotifier for TestNotifier {
        fn push(&mut self, descriptor_index: u16, bytes_written: u32) {
            self.completions.push((descriptor_index, bytes_written));
        }

        fn notify(&mut self) {}
    }

    fn device(stream: &TestStream) -> (TpmDevice, Arc<Mutex<TestNotifier>>, Arc<TestMemory>) {
        let mem = Arc::new(TestMemory(Mutex::new(vec![0; 0x4000])));
        let device = TpmDevice::new(
            Box::new(TestBackend {
                channel: StreamChannel::new(stream.clone()),
            }),
            mem.clone(),
        );
        (device, Arc::new(Mutex::new(TestNotifier::default())), mem)
    }

    fn request_element(
        mem: &TestMemory,
        notifier: &Arc<Mutex<TestNotifier>>,
        request: &[u8],
    ) -> TpmQueueElement {
        mem.write_at(0x1000, request).unwrap();
        TpmQueueElement::new(
            vec![
                QueuePayload {
                    writeable: false,
                    address: 0x1000,
                    length: request.len() as u32,
                },
                QueuePayload {
                    writeable: true,
                    address: 0x2000,
                    length: 64,
                },
            ],
            notifier.clone(),
            0,
        )
    }

    #[test]
    fn worker_continues_after_success() {
        let stream = TestStream::default();
        let (mut device, notifier, mem) = device(&stream);
        stream
            .inner
            .lock()
            .1
            .extend([0x80, 0x01, 0, 0, 0, 10, 0, 0, 0, 0]);

        let element = request_element(&mem, &notifier, &[1, 2, 3, 4]);
        assert!(block_on(device.process_work(Ok(element))));
        assert_eq!(notifier.lock().completions, vec![(0, 10)]);
    }

    #[test]
    fn worker_continues_after_malformed_request() {
        let stream = TestStream::default();
        let (mut device, notifier, _mem) = device(&stream);
        let element = TpmQueueElement::new(Vec::new(), notifier.clone(), 0);
        assert!(block_on(device.process_work(Ok(element))));
        assert_eq!(notifier.lock().completions, vec![(0, 0)]);
    }

    #[test]
    fn worker_stops_after_channel_fault() {
        let stream = TestStream::default();
        let (mut device, notifier, mem) = device(&stream);
        // No response queued: the read side reports a disconnect.
        let element = request_element(&mem, &notifier, &[1, 2, 3, 4]);
        assert!(!block_on(device.process_work(Ok(element))));
        assert_eq!(notifier.lock().completions, vec![(0, 0)]);
    }

    #[test]
    fn worker_stops_on_queue_error() {
        let stream = TestStream::default();
        let (mut device, _notifier, _mem) = device(&stream);
        assert!(!block_on(
            device.process_work(Err(anyhow::anyhow!("descriptor chain too long")))
        ));
    }
}
