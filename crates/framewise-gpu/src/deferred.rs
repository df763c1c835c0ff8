//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! With several frames in flight, a resource the CPU has stopped using may
//! still be read by a frame the GPU has not finished. Retired resources wait
//! here, tagged with the frame they were retired on, until every frame that
//! could reference them has completed.

use std::collections::VecDeque;

/// A resource pending deletion.
struct PendingDeletion<T> {
    item: T,
    frame_queued: u64,
}

/// Queue for deferred deletions.
///
/// Items are released once `frames_in_flight` frames have passed since they
/// were queued.
pub struct DeferredDeletionQueue<T> {
    pending: VecDeque<PendingDeletion<T>>,
    frames_in_flight: usize,
}

impl<T> DeferredDeletionQueue<T> {
    /// Create a new deferred deletion queue.
    pub const fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue an item retired on `frame_number`.
    pub fn queue(&mut self, item: T, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            item,
            frame_queued: frame_number,
        });
    }

    /// Hand every item that is now safe to delete to `free`.
    ///
    /// Stops at the first error; items not yet freed stay queued.
    pub fn process<E>(
        &mut self,
        current_frame_number: u64,
        mut free: impl FnMut(T) -> Result<(), E>,
    ) -> Result<(), E> {
        let frames = self.frames_in_flight as u64;

        // Frame numbers are non-decreasing, so only the front can mature.
        while self
            .pending
            .front()
            .is_some_and(|p| p.frame_queued + frames <= current_frame_number)
        {
            if let Some(pending) = self.pending.pop_front() {
                free(pending.item)?;
            }
        }

        Ok(())
    }

    /// Release all pending items immediately.
    ///
    /// Only valid after the device is idle.
    pub fn flush<E>(&mut self, mut free: impl FnMut(T) -> Result<(), E>) -> Result<(), E> {
        while let Some(pending) = self.pending.pop_front() {
            free(pending.item)?;
        }
        Ok(())
    }

    /// Number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
