//! Asynchronous bulk pipes and the transmit pipeline
//!
//! Transfers run on two threads per device: a reader that serves one armed
//! bulk-in read at a time and a writer that performs queued bulk-out
//! writes. Both report through [`Completion`] events on a channel consumed
//! by the device worker, so every completion is handled one at a time on a
//! single thread.
//!
//! [`TransmitPipeline`] drains a queue of wire records into max-packet sized
//! bulk writes. A [`BusyGate`] per device keeps at most one write in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{trace, warn};

use crate::error::{CanError, Result};
use crate::ring_buffer::RingBuffer;
use crate::transport::Transport;

/// Event posted by a transfer thread when a transfer finishes
#[derive(Debug)]
pub enum Completion {
    /// Bulk-in read finished with the received bytes
    Read(rusb::Result<Vec<u8>>),
    /// Bulk-out write finished with the number of bytes written
    Write(rusb::Result<usize>),
    /// Stop the worker
    Shutdown,
}

struct ReadRequest {
    endpoint: u8,
    len: usize,
}

struct WriteRequest {
    endpoint: u8,
    data: Vec<u8>,
}

/// Transfer counters of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// Bulk-in reads armed so far
    pub reads_armed: u64,
    /// Asynchronous bulk-out writes issued
    pub async_writes: u64,
    /// Synchronous bulk-out writes issued
    pub sync_writes: u64,
}

/// Reader and writer threads of one device
pub struct AsyncPipes {
    read_tx: Mutex<Option<Sender<ReadRequest>>>,
    write_tx: Mutex<Option<Sender<WriteRequest>>>,
    closed: Arc<AtomicBool>,
    reads_armed: AtomicU64,
    async_writes: AtomicU64,
    sync_writes: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncPipes {
    /// Start the transfer threads
    ///
    /// `poll` bounds how long a pending read blocks before it re-checks for
    /// shutdown. `write_timeout` applies to each bulk-out write.
    pub fn spawn(
        name: &str,
        transport: Arc<dyn Transport>,
        completions: Sender<Completion>,
        poll: Duration,
        write_timeout: Duration,
    ) -> Result<Self> {
        let closed = Arc::new(AtomicBool::new(false));
        let (read_tx, read_rx) = mpsc::channel();
        let (write_tx, write_rx) = mpsc::channel();

        let reader = {
            let transport = Arc::clone(&transport);
            let completions = completions.clone();
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name(format!("{name}-rx"))
                .spawn(move || reader_loop(transport, read_rx, completions, closed, poll))
                .map_err(|e| CanError::Internal(format!("spawn reader: {e}")))?
        };
        let writer = {
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name(format!("{name}-tx"))
                .spawn(move || writer_loop(transport, write_rx, completions, closed, write_timeout))
                .map_err(|e| CanError::Internal(format!("spawn writer: {e}")))?
        };

        Ok(Self {
            read_tx: Mutex::new(Some(read_tx)),
            write_tx: Mutex::new(Some(write_tx)),
            closed,
            reads_armed: AtomicU64::new(0),
            async_writes: AtomicU64::new(0),
            sync_writes: AtomicU64::new(0),
            threads: Mutex::new(vec![reader, writer]),
        })
    }

    /// Arm one bulk-in read of up to `len` bytes
    pub fn submit_read(&self, endpoint: u8, len: usize) -> Result<()> {
        let guard = self.read_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(CanError::DeviceGone)?;
        tx.send(ReadRequest { endpoint, len })
            .map_err(|_| CanError::DeviceGone)?;
        self.reads_armed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue one bulk-out write
    pub fn submit_write(&self, endpoint: u8, data: Vec<u8>) -> Result<()> {
        let guard = self.write_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(CanError::DeviceGone)?;
        tx.send(WriteRequest { endpoint, data })
            .map_err(|_| CanError::DeviceGone)?;
        self.async_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn count_sync_write(&self) {
        self.sync_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PipeStats {
        PipeStats {
            reads_armed: self.reads_armed.load(Ordering::Relaxed),
            async_writes: self.async_writes.load(Ordering::Relaxed),
            sync_writes: self.sync_writes.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting transfers; the threads exit once idle
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.read_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.write_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Shut down and wait for both threads
    pub fn join(&self) {
        self.shutdown();
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in threads {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("transfer thread panicked");
            }
        }
    }
}

impl Drop for AsyncPipes {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reader_loop(
    transport: Arc<dyn Transport>,
    requests: Receiver<ReadRequest>,
    completions: Sender<Completion>,
    closed: Arc<AtomicBool>,
    poll: Duration,
) {
    while let Ok(request) = requests.recv() {
        let mut buf = vec![0u8; request.len];
        let result = loop {
            if closed.load(Ordering::Acquire) {
                return;
            }
            match transport.read_bulk(request.endpoint, &mut buf, poll) {
                Err(rusb::Error::Timeout) => continue,
                Ok(n) => {
                    buf.truncate(n);
                    break Ok(buf);
                }
                Err(e) => break Err(e),
            }
        };
        trace!("bulk in 0x{:02x} done", request.endpoint);
        if completions.send(Completion::Read(result)).is_err() {
            return;
        }
    }
}

fn writer_loop(
    transport: Arc<dyn Transport>,
    requests: Receiver<WriteRequest>,
    completions: Sender<Completion>,
    closed: Arc<AtomicBool>,
    timeout: Duration,
) {
    while let Ok(request) = requests.recv() {
        if closed.load(Ordering::Acquire) {
            return;
        }
        let result = transport.write_bulk(request.endpoint, &request.data, timeout);
        trace!(
            "bulk out 0x{:02x} {} bytes: {:?}",
            request.endpoint,
            request.data.len(),
            result
        );
        if completions.send(Completion::Write(result)).is_err() {
            return;
        }
    }
}

/// Non-blocking guard allowing one bulk-out write in flight
#[derive(Debug, Default)]
pub struct BusyGate(AtomicBool);

impl BusyGate {
    /// Set the gate; `false` if it was already set
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A command or message record in a backend's outbound wire format
pub trait WireRecord: Send {
    /// Largest encoded size of any record of this type
    const MAX_LEN: usize;
    /// Bytes marking the end of the records in a packet
    const TERMINATOR: &'static [u8];

    fn encoded_len(&self) -> usize;
    fn encode_into(&self, out: &mut Vec<u8>);
}

/// Result of one [`TransmitPipeline::drain_and_send`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A write was already in flight; nothing was done
    Busy,
    /// The queue was empty; the gate is clear
    Idle,
    /// A packet of this many bytes was handed to the writer
    Submitted(usize),
}

/// Outbound record queue feeding max-packet sized bulk writes
pub struct TransmitPipeline<R> {
    queue: RingBuffer<R>,
    max_packet: usize,
    pad_to_packet: bool,
}

impl<R: WireRecord> TransmitPipeline<R> {
    /// Create a pipeline for `max_packet` byte bulk writes
    ///
    /// With `pad_to_packet` every packet is zero filled to `max_packet`.
    pub fn new(capacity: usize, max_packet: usize, pad_to_packet: bool) -> Result<Self> {
        if R::MAX_LEN > max_packet {
            return Err(CanError::Param("record larger than the bulk-out packet"));
        }
        Ok(Self {
            queue: RingBuffer::new(capacity)?,
            max_packet,
            pad_to_packet,
        })
    }

    /// Queue a record; a full queue is reported as transmit overflow
    pub fn enqueue(&self, record: R) -> Result<()> {
        self.queue
            .push(record)
            .map_err(|_| CanError::TxBufferOverflow)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&self) {
        self.queue.clear();
    }

    /// Move whole records into one packet
    ///
    /// Records are taken in order while the next one fits in the remaining
    /// space, so no record is ever split. Returns an empty vector when the
    /// queue is empty.
    pub fn fill_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.max_packet);
        loop {
            let room = self.max_packet - packet.len();
            match self.queue.pop_if(|record| record.encoded_len() <= room) {
                Some(record) => record.encode_into(&mut packet),
                None => break,
            }
        }
        if packet.is_empty() {
            return packet;
        }
        if packet.len() + R::TERMINATOR.len() <= self.max_packet {
            packet.extend_from_slice(R::TERMINATOR);
        }
        if self.pad_to_packet {
            packet.resize(self.max_packet, 0);
        }
        packet
    }

    /// Send the next packet unless a write is already in flight
    ///
    /// On `Submitted` the gate stays set until the write completion calls
    /// [`BusyGate::release`] and drains again.
    pub fn drain_and_send(
        &self,
        gate: &BusyGate,
        mut submit: impl FnMut(Vec<u8>) -> Result<()>,
    ) -> Result<DrainOutcome> {
        loop {
            if !gate.try_acquire() {
                return Ok(DrainOutcome::Busy);
            }
            let packet = self.fill_packet();
            if packet.is_empty() {
                gate.release();
                // A record queued between the pop and the release would
                // otherwise wait for the next enqueue.
                if self.queue.is_empty() {
                    return Ok(DrainOutcome::Idle);
                }
                continue;
            }
            let len = packet.len();
            if let Err(e) = submit(packet) {
                gate.release();
                return Err(e);
            }
            return Ok(DrainOutcome::Submitted(len));
        }
    }
}
