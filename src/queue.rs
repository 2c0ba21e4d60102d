// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Queue boundary types shared with the platform's virtio ring machinery.
//!
//! The descriptor-table walk, available/used ring bookkeeping, and guest
//! notification transport all live in the platform. This module defines the
//! shape of what crosses the boundary: one popped element with its
//! scatter/gather payload, and the completion contract that returns it to
//! the guest.

use crate::mem::GuestMemory;
use crate::mem::GuestMemoryError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// One memory segment of a descriptor chain.
pub struct QueuePayload {
    /// Device-writeable (response) rather than device-readable (request).
    pub writeable: bool,
    pub address: u64,
    pub length: u32,
}

/// Returns completed elements to the guest.
///
/// For each popped element, `push` then `notify` must be called exactly
/// once, in that order. `push` places the element on the used ring with the
/// response length; `notify` raises the guest-visible signal (interrupt or
/// eventfd) that completions are available.
pub trait CompletionNotifier: Send {
    fn push(&mut self, descriptor_index: u16, bytes_written: u32);
    fn notify(&mut self);
}

/// A popped queue element, exclusively owned until completed.
///
/// Completion happens exactly once on every path: explicitly via
/// [`complete`](Self::complete), or with a zero-length response when the
/// element is dropped. A dropped-without-completion element would otherwise
/// permanently starve the guest driver waiting on that command.
pub struct TpmQueueElement {
    pub payload: Vec<QueuePayload>,
    notifier: Arc<Mutex<dyn CompletionNotifier>>,
    descriptor_index: u16,
    completed: bool,
}

impl TpmQueueElement {
    pub fn new(
        payload: Vec<QueuePayload>,
        notifier: Arc<Mutex<dyn CompletionNotifier>>,
        descriptor_index: u16,
    ) -> Self {
        Self {
            payload,
            notifier,
            descriptor_index,
            completed: false,
        }
    }

    pub fn descriptor_index(&self) -> u16 {
        self.descriptor_index
    }

    /// Total length of all readable or all writeable payload segments.
    pub fn payload_length(&self, writeable: bool) -> u64 {
        self.payload
            .iter()
            .filter(|p| p.writeable == writeable)
            .fold(0, |acc, p| acc + p.length as u64)
    }

    /// Reads the readable payload segments into `target`, in chain order.
    pub fn read(
        &self,
        mem: &dyn GuestMemory,
        target: &mut [u8],
    ) -> Result<usize, GuestMemoryError> {
        let mut remaining = target;
        let mut read_bytes = 0;
        for payload in &self.payload {
            if payload.writeable {
                continue;
            }

            let size = std::cmp::min(payload.length as usize, remaining.len());
            let (current, next) = remaining.split_at_mut(size);
            mem.read_at(payload.address, current)?;
            read_bytes += size;
            if next.is_empty() {
                break;
            }

            remaining = next;
        }

        Ok(read_bytes)
    }

    /// Returns the element to the used ring and signals the guest.
    pub fn complete(&mut self, bytes_written: u32) {
        assert!(!self.completed);
        let mut notifier = self.notifier.lock();
        notifier.push(self.descriptor_index, bytes_written);
        notifier.notify();
        self.completed = true;
    }
}

impl Drop for TpmQueueElement {
    fn drop(&mut self) {
        if !self.completed {
            self.complete(0);
        }
    }
}

/// Per-queue work callback, driven by the platform's queue worker whenever
/// the guest signals that the queue is not empty.
///
/// Returning `false` stops the worker; no further elements are delivered
/// until the device is re-enabled.
#[async_trait]
pub trait QueueWorkerContext {
    async fn process_work(&mut self, work: anyhow::Result<TpmQueueElement>) -> bool;
}
