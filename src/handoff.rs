//! Lock-free control → audio handoff.
//!
//! A bounded SPSC queue carries owned values (parameter snapshots, finished IR
//! kernels) to the audio thread. Whatever the audio thread replaces travels back
//! on a second queue so that memory is freed on the control side, never inside
//! `process`.

use assert_no_alloc::permit_alloc;
use ringbuf::{Consumer, Producer, RingBuffer};

/// Control-thread end.
pub struct Handoff<T> {
    outgoing: Producer<T>,
    garbage: Consumer<T>,
}

/// Audio-thread end.
pub struct HandoffReceiver<T> {
    incoming: Consumer<T>,
    retired: Producer<T>,
}

/// Create a handoff with room for `capacity` values in flight.
pub fn handoff<T>(capacity: usize) -> (Handoff<T>, HandoffReceiver<T>) {
    let capacity = capacity.max(1);
    let (outgoing, incoming) = RingBuffer::<T>::new(capacity).split();
    // Room for everything in flight plus what the audio side still holds.
    let (retired, garbage) = RingBuffer::<T>::new(capacity * 2 + 1).split();
    (
        Handoff { outgoing, garbage },
        HandoffReceiver { incoming, retired },
    )
}

impl<T> Handoff<T> {
    /// Queue `value` for the audio thread. Gives it back if the queue is full.
    pub fn send(&mut self, value: T) -> Result<(), T> {
        self.collect_garbage();
        self.outgoing.push(value)
    }

    /// Drop everything the audio thread has retired. Returns how many values were freed.
    pub fn collect_garbage(&mut self) -> usize {
        let mut freed = 0;
        while let Some(value) = self.garbage.pop() {
            drop(value);
            freed += 1;
        }
        freed
    }

    /// Values sent but not yet picked up.
    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }
}

impl<T> HandoffReceiver<T> {
    /// Oldest pending value, if any.
    pub fn poll(&mut self) -> Option<T> {
        self.incoming.pop()
    }

    /// Newest pending value; older ones are retired unread.
    pub fn poll_latest(&mut self) -> Option<T> {
        let mut latest = None;
        while let Some(value) = self.incoming.pop() {
            if let Some(stale) = latest.replace(value) {
                self.retire(stale);
            }
        }
        latest
    }

    /// Hand a replaced value back for freeing on the control thread.
    pub fn retire(&mut self, value: T) {
        if let Err(value) = self.retired.push(value) {
            // Control side stopped collecting; free here as a last resort.
            permit_alloc(|| drop(value));
        }
    }
}
