//! Bounded FIFO shared between a producer and a consumer thread
//!
//! Push fails when the buffer is full and pop returns `None` when it is
//! empty; nothing is ever overwritten. Each buffer has its own lock, so a
//! slow consumer on one buffer never stalls the producer of another.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{CanError, Result};

struct RingState<T> {
    slots: Vec<Option<T>>,
    /// Monotonic logical head; the physical index is `head % capacity`
    head: u64,
    count: usize,
}

/// Fixed capacity circular queue
pub struct RingBuffer<T> {
    state: Mutex<RingState<T>>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Allocate a buffer for `capacity` records
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CanError::Param("ring buffer capacity must be non-zero"));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| CanError::NoMemory)?;
        slots.resize_with(capacity, || None);
        Ok(Self {
            state: Mutex::new(RingState {
                slots,
                head: 0,
                count: 0,
            }),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RingState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record, handing it back if the buffer is full
    pub fn push(&self, record: T) -> std::result::Result<(), T> {
        let mut state = self.lock();
        if state.count == self.capacity {
            return Err(record);
        }
        let index = ((state.head + state.count as u64) % self.capacity as u64) as usize;
        state.slots[index] = Some(record);
        state.count += 1;
        Ok(())
    }

    /// Remove the oldest record
    pub fn pop(&self) -> Option<T> {
        self.pop_if(|_| true)
    }

    /// Remove the oldest record if `accept` returns `true` for it
    pub fn pop_if(&self, accept: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut state = self.lock();
        if state.count == 0 {
            return None;
        }
        let index = (state.head % self.capacity as u64) as usize;
        if !state.slots[index].as_ref().is_some_and(accept) {
            return None;
        }
        let record = state.slots[index].take();
        state.head += 1;
        state.count -= 1;
        record
    }

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued record
    pub fn clear(&self) {
        let mut state = self.lock();
        while state.count > 0 {
            let index = (state.head % self.capacity as u64) as usize;
            state.slots[index] = None;
            state.head += 1;
            state.count -= 1;
        }
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
