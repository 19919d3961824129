//! Request/response correlation
//!
//! A caller registers the response it expects (command number and, when
//! the protocol echoes one, a transaction id) before sending the request,
//! then blocks on a one-shot channel with a bounded timeout. The device
//! worker offers every decoded frame to [`Correlator::complete`], which
//! wakes the oldest matching waiter.
//!
//! Several round trips may be outstanding at once. A waiter that times out
//! removes its entry, so a late response is dropped rather than satisfying
//! some later request.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{CanError, Result};

/// Identifies the response a waiter expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseKey {
    pub command: u8,
    /// `None` accepts any transaction id
    pub trans_id: Option<u16>,
}

impl ResponseKey {
    pub fn command(command: u8) -> Self {
        Self {
            command,
            trans_id: None,
        }
    }

    pub fn with_trans_id(command: u8, trans_id: u16) -> Self {
        Self {
            command,
            trans_id: Some(trans_id),
        }
    }

    fn matches(&self, command: u8, trans_id: Option<u16>) -> bool {
        self.command == command
            && match (self.trans_id, trans_id) {
                (None, _) => true,
                (Some(expected), Some(actual)) => expected == actual,
                (Some(_), None) => false,
            }
    }
}

struct Pending {
    ticket: u64,
    key: ResponseKey,
    tx: SyncSender<Vec<u8>>,
}

/// Table of outstanding request/response round trips
pub struct Correlator {
    pending: Mutex<Vec<Pending>>,
    next_ticket: AtomicU64,
    next_trans_id: AtomicU16,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(0),
            next_trans_id: AtomicU16::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next transaction id, masked to the protocol's field width
    pub fn next_trans_id(&self, mask: u16) -> u16 {
        loop {
            let id = self.next_trans_id.fetch_add(1, Ordering::Relaxed) & mask;
            if id != 0 {
                return id;
            }
        }
    }

    /// Register interest in a response; must happen before the request is sent
    pub fn register(&self, key: ResponseKey) -> Waiter<'_> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(1);
        self.lock().push(Pending { ticket, key, tx });
        trace!("waiting for command {} ({:?})", key.command, key.trans_id);
        Waiter {
            correlator: self,
            ticket,
            key,
            rx,
        }
    }

    /// Deliver a received frame to the oldest matching waiter
    ///
    /// Returns `true` if a waiter was woken.
    pub fn complete(&self, command: u8, trans_id: Option<u16>, frame: &[u8]) -> bool {
        let mut pending = self.lock();
        let Some(pos) = pending.iter().position(|p| p.key.matches(command, trans_id)) else {
            return false;
        };
        let entry = pending.remove(pos);
        drop(pending);
        entry.tx.try_send(frame.to_vec()).is_ok()
    }

    /// Number of outstanding waiters
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Drop every waiter; their `wait` calls fail with `DeviceGone`
    pub fn cancel_all(&self) {
        self.lock().clear();
    }

    fn forget(&self, ticket: u64) {
        self.lock().retain(|p| p.ticket != ticket);
    }
}

/// One registered round trip
pub struct Waiter<'a> {
    correlator: &'a Correlator,
    ticket: u64,
    key: ResponseKey,
    rx: Receiver<Vec<u8>>,
}

impl Waiter<'_> {
    /// Block until the response arrives or `timeout` elapses
    pub fn wait(self, timeout: Duration) -> Result<Vec<u8>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => {
                debug!(
                    "no response for command {} ({:?}) within {:?}",
                    self.key.command, self.key.trans_id, timeout
                );
                Err(CanError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(CanError::DeviceGone),
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_complete_wakes_waiter() {
        let correlator = Arc::new(Correlator::new());
        let waiter_correlator = Arc::clone(&correlator);
        let handle = thread::spawn(move || {
            let waiter = waiter_correlator.register(ResponseKey::with_trans_id(27, 5));
            waiter.wait(Duration::from_secs(2))
        });
        while correlator.pending() == 0 {
            thread::yield_now();
        }
        assert!(!correlator.complete(27, Some(4), &[1]));
        assert!(correlator.complete(27, Some(5), &[4, 27, 5, 0]));
        assert_eq!(handle.join().unwrap().unwrap(), vec![4, 27, 5, 0]);
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn test_timeout_is_bounded() {
        let correlator = Correlator::new();
        let start = Instant::now();
        let result = correlator
            .register(ResponseKey::command(29))
            .wait(Duration::from_millis(30));
        assert!(matches!(result, Err(CanError::Timeout)));
        assert!(start.elapsed() < Duration::from_secs(1));
        // The stale entry is gone, a late response finds no waiter
        assert_eq!(correlator.pending(), 0);
        assert!(!correlator.complete(29, None, &[]));
    }

    #[test]
    fn test_late_response_not_delivered_to_next_waiter() {
        let correlator = Correlator::new();
        let key = ResponseKey::with_trans_id(27, 4);
        let result = correlator.register(key).wait(Duration::from_millis(10));
        assert!(matches!(result, Err(CanError::Timeout)));

        // Late frame for the abandoned request
        assert!(!correlator.complete(27, Some(4), b"stale"));
        assert_eq!(correlator.pending(), 0);

        let waiter = correlator.register(key);
        assert!(matches!(
            waiter.wait(Duration::from_millis(10)),
            Err(CanError::Timeout)
        ));

        let waiter = correlator.register(key);
        assert!(correlator.complete(27, Some(4), b"fresh"));
        assert_eq!(waiter.wait(Duration::from_millis(10)).unwrap(), b"fresh");
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn test_concurrent_waiters() {
        let correlator = Correlator::new();
        let a = correlator.register(ResponseKey::with_trans_id(85, 1));
        let b = correlator.register(ResponseKey::with_trans_id(85, 2));
        assert!(correlator.complete(85, Some(2), b"b"));
        assert!(correlator.complete(85, Some(1), b"a"));
        assert_eq!(b.wait(Duration::from_millis(10)).unwrap(), b"b");
        assert_eq!(a.wait(Duration::from_millis(10)).unwrap(), b"a");
    }

    #[test]
    fn test_wildcard_trans_id() {
        let correlator = Correlator::new();
        let waiter = correlator.register(ResponseKey::command(20));
        assert!(correlator.complete(20, Some(99), &[20]));
        assert!(waiter.wait(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_cancel_all() {
        let correlator = Correlator::new();
        let waiter = correlator.register(ResponseKey::command(1));
        correlator.cancel_all();
        assert!(matches!(
            waiter.wait(Duration::from_millis(10)),
            Err(CanError::DeviceGone)
        ));
    }

    #[test]
    fn test_trans_id_mask() {
        let correlator = Correlator::new();
        for _ in 0..600 {
            let id = correlator.next_trans_id(0xFF);
            assert!(id != 0 && id <= 0xFF);
        }
    }
}
