//! Per-device state and completion worker
//!
//! A [`Device`] is one logical CAN channel. It owns the endpoint choice,
//! the decoded event buffer, the cached bus timing and chip state, and the
//! backend holding the vendor protocol. Transfer completions are processed
//! by one worker thread per device, so the receive and transmit pipelines
//! never run concurrently with each other.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};

use crate::backend::{Backend, BackendKind};
use crate::config::Config;
use crate::constants::{
    CAN_CHANNELDATA_CARD_SERIAL_NO, CAN_CHANNELDATA_CHANNEL_CAP, CAN_CHANNELDATA_DEVDESCR_ASCII,
    CAN_NOTIFY_RX, CAN_NOTIFY_STATUS, CAN_OPEN_CAN_FD,
};
use crate::correlator::{Correlator, ResponseKey};
use crate::error::{CanError, Result};
use crate::message::CanMsg;
use crate::pipeline::{
    AsyncPipes, BusyGate, Completion, DrainOutcome, PipeStats, TransmitPipeline, WireRecord,
};
use crate::registry::CanHandle;
use crate::ring_buffer::RingBuffer;
use crate::structures::{
    BusParams, BusParamsFd, BusStatus, BusTiming, ChannelData, ChipState, DeviceInfo, Endpoints,
    Notification,
};
use crate::transport::Transport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity of a channel on its physical adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Index of this CAN channel on the adapter
    pub channel: u8,
}

/// One logical CAN channel
pub struct Device {
    handle: CanHandle,
    id: DeviceId,
    config: Config,
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    events: RingBuffer<CanMsg>,
    out_busy: BusyGate,
    /// Cleared when the adapter is detached; the handle slot stays
    active: AtomicBool,
    /// Cleared after a transport failure
    alive: AtomicBool,
    fd_mode: AtomicBool,
    channel_count: AtomicU8,
    chip: Mutex<ChipState>,
    info: Mutex<DeviceInfo>,
    timing: Mutex<BusTiming>,
    notify: Mutex<Option<(Sender<Notification>, u32)>>,
    correlator: Correlator,
    pipes: AsyncPipes,
    completions: Mutex<Sender<Completion>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    backend: Box<dyn Backend>,
}

impl Device {
    /// Create the device, its transfer threads and its worker
    ///
    /// Nothing is sent to the adapter; call [`Device::init_hardware`] next.
    pub fn spawn(
        handle: CanHandle,
        id: DeviceId,
        transport: Arc<dyn Transport>,
        endpoints: Endpoints,
        backend: Box<dyn Backend>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel();
        let name = format!("can{}", handle.index());
        let pipes = AsyncPipes::spawn(
            &name,
            Arc::clone(&transport),
            tx.clone(),
            config.read_poll_interval,
            config.usb_timeout,
        )?;

        let device = Arc::new(Self {
            handle,
            id,
            config: config.clone(),
            transport,
            endpoints,
            events: RingBuffer::new(config.event_buffer_capacity)?,
            out_busy: BusyGate::default(),
            active: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            fd_mode: AtomicBool::new(false),
            channel_count: AtomicU8::new(1),
            chip: Mutex::new(ChipState::default()),
            info: Mutex::new(DeviceInfo::default()),
            timing: Mutex::new(BusTiming::default()),
            notify: Mutex::new(None),
            correlator: Correlator::new(),
            pipes,
            completions: Mutex::new(tx),
            worker: Mutex::new(None),
            backend,
        });

        let weak = Arc::downgrade(&device);
        let worker = thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || run_worker(weak, rx))
            .map_err(|e| CanError::Internal(format!("spawn worker: {e}")))?;
        *lock(&device.worker) = Some(worker);

        debug!(
            "{}: {:04x}:{:04x} channel {} as {:?}, in 0x{:02x}/{} out 0x{:02x}/{}",
            name,
            id.vendor_id,
            id.product_id,
            id.channel,
            device.backend.kind(),
            endpoints.bulk_in.address,
            endpoints.bulk_in.max_packet_size,
            endpoints.bulk_out.address,
            endpoints.bulk_out.max_packet_size
        );
        Ok(device)
    }

    pub fn handle(&self) -> CanHandle {
        self.handle
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_fd(&self) -> bool {
        self.fd_mode.load(Ordering::Acquire)
    }

    pub fn set_fd(&self, fd: bool) {
        self.fd_mode.store(fd, Ordering::Release);
    }

    pub fn channel_count(&self) -> u8 {
        self.channel_count.load(Ordering::Acquire)
    }

    pub fn set_channel_count(&self, count: u8) {
        self.channel_count.store(count.max(1), Ordering::Release);
    }

    pub fn pipe_stats(&self) -> PipeStats {
        self.pipes.stats()
    }

    pub fn events_pending(&self) -> usize {
        self.events.len()
    }

    fn ensure_usable(&self) -> Result<()> {
        if !self.is_active() {
            return Err(CanError::InvalidHandle(self.handle.index()));
        }
        if !self.is_alive() {
            return Err(CanError::DeviceGone);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // canlib operations
    // ------------------------------------------------------------------

    pub fn init_hardware(&self) -> Result<()> {
        self.ensure_usable()?;
        self.backend.init_hardware(self)
    }

    pub fn open_channel(&self, flags: u32) -> Result<()> {
        self.ensure_usable()?;
        self.backend.open_channel(self, flags)?;
        debug!(
            "{}: open, {} mode",
            self.handle,
            if flags & CAN_OPEN_CAN_FD != 0 { "FD" } else { "classic" }
        );
        Ok(())
    }

    pub fn set_bus_params(&self, params: BusParams) -> Result<()> {
        self.ensure_usable()?;
        self.backend.set_bus_params(self, params)
    }

    pub fn set_bus_params_fd(&self, params: BusParamsFd) -> Result<()> {
        self.ensure_usable()?;
        self.backend.set_bus_params_fd(self, params)
    }

    pub fn bus_on(&self) -> Result<()> {
        self.ensure_usable()?;
        self.backend.bus_on(self)?;
        // Backends that learn the state on start have already left Stopped
        if self.chip_state().status == BusStatus::Stopped {
            self.set_bus_status(BusStatus::ErrorActive);
        }
        debug!("{}: bus on", self.handle);
        Ok(())
    }

    pub fn bus_off(&self) -> Result<()> {
        self.ensure_usable()?;
        self.backend.bus_off(self)?;
        self.set_bus_status(BusStatus::Stopped);
        debug!("{}: bus off", self.handle);
        Ok(())
    }

    pub fn write(&self, id: u32, payload: &[u8], dlc: usize, flags: u32) -> Result<()> {
        self.ensure_usable()?;
        self.backend.write(self, id, payload, dlc, flags)
    }

    pub fn read(&self) -> Result<CanMsg> {
        if !self.is_active() {
            return Err(CanError::InvalidHandle(self.handle.index()));
        }
        // Events decoded before a teardown are still readable
        self.backend.read(self)
    }

    pub fn read_status(&self) -> Result<u32> {
        self.ensure_usable()?;
        Ok(self.chip_state().status_flags())
    }

    pub fn channel_data(&self, item: i32) -> Result<ChannelData> {
        let info = self.info();
        match item {
            CAN_CHANNELDATA_CHANNEL_CAP => Ok(ChannelData::ChannelCapabilities(info.capabilities)),
            CAN_CHANNELDATA_CARD_SERIAL_NO => Ok(ChannelData::CardSerialNo(info.serial_number)),
            CAN_CHANNELDATA_DEVDESCR_ASCII => Ok(ChannelData::DeviceDescription(info.description)),
            _ => Err(CanError::NotImplemented("channel data item")),
        }
    }

    pub fn set_notify(&self, sender: Option<Sender<Notification>>, flags: u32) {
        *lock(&self.notify) = sender.map(|tx| (tx, flags));
    }

    /// Release backend state; the device stays usable for a new open
    pub fn close(&self) -> Result<()> {
        if !self.is_active() {
            return Err(CanError::InvalidHandle(self.handle.index()));
        }
        self.backend.close(self)?;
        self.set_notify(None, 0);
        debug!("{}: closed", self.handle);
        Ok(())
    }

    /// Stop all threads and release the transport
    ///
    /// Called when the adapter goes away; the handle becomes inactive.
    pub fn detach(&self) {
        self.active.store(false, Ordering::Release);
        self.alive.store(false, Ordering::Release);
        self.correlator.cancel_all();
        self.pipes.join();
        if lock(&self.completions).send(Completion::Shutdown).is_err() {
            warn!("{}: completion worker already gone", self.handle);
        }
        if let Some(worker) = lock(&self.worker).take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("{}: completion worker panicked", self.handle);
            }
        }
        debug!("{}: detached", self.handle);
    }

    // ------------------------------------------------------------------
    // State used by the backends
    // ------------------------------------------------------------------

    pub fn chip_state(&self) -> ChipState {
        *lock(&self.chip)
    }

    pub fn info(&self) -> DeviceInfo {
        lock(&self.info).clone()
    }

    pub fn update_info(&self, f: impl FnOnce(&mut DeviceInfo)) {
        f(&mut lock(&self.info));
    }

    pub fn timing(&self) -> BusTiming {
        *lock(&self.timing)
    }

    pub fn update_timing(&self, f: impl FnOnce(&mut BusTiming)) {
        f(&mut lock(&self.timing));
    }

    fn set_bus_status(&self, status: BusStatus) {
        let changed = {
            let mut chip = lock(&self.chip);
            let changed = chip.status != status;
            chip.status = status;
            changed
        };
        if changed {
            self.post_notification(CAN_NOTIFY_STATUS);
        }
    }

    /// Apply a chip state event reported by the adapter
    ///
    /// Counters are always taken over. The state only moves while the chip
    /// is started; a stopped channel stays stopped until bus on.
    pub fn apply_chip_state(&self, status: Option<BusStatus>, tx_errors: u8, rx_errors: u8) {
        let changed = {
            let mut chip = lock(&self.chip);
            chip.tx_errors = tx_errors;
            chip.rx_errors = rx_errors;
            match status {
                Some(status) if chip.status != BusStatus::Stopped && chip.status != status => {
                    debug!(
                        "{}: {} -> {} (tx {tx_errors}, rx {rx_errors})",
                        self.handle,
                        chip.status.name(),
                        status.name()
                    );
                    chip.status = status;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.post_notification(CAN_NOTIFY_STATUS);
        }
    }

    /// Take over the state the adapter reports in answer to bus on
    pub fn apply_start_state(&self, status: BusStatus, tx_errors: u8, rx_errors: u8) {
        {
            let mut chip = lock(&self.chip);
            chip.tx_errors = tx_errors;
            chip.rx_errors = rx_errors;
        }
        self.set_bus_status(status);
    }

    /// Append a decoded message; drops it when the event buffer is full
    pub fn push_event(&self, msg: CanMsg) {
        trace!("{}: rx {}", self.handle, msg);
        if self.events.push(msg).is_err() {
            warn!("{}: event buffer full, message dropped", self.handle);
            return;
        }
        self.post_notification(CAN_NOTIFY_RX);
    }

    pub fn pop_event(&self) -> Result<CanMsg> {
        self.events.pop().ok_or(CanError::NoMsg)
    }

    pub fn clear_events(&self) {
        self.events.clear();
    }

    fn post_notification(&self, event: u32) {
        let mut notify = lock(&self.notify);
        if let Some((tx, flags)) = notify.as_ref() {
            if flags & event != 0 {
                let note = Notification {
                    handle: self.handle,
                    event,
                };
                if tx.send(note).is_err() {
                    *notify = None;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // I/O helpers
    // ------------------------------------------------------------------

    /// Arm one bulk-in read of a full packet
    pub fn arm_read(&self) -> Result<()> {
        let ep = self.endpoints.bulk_in;
        self.pipes.submit_read(ep.address, ep.max_packet_size as usize)
    }

    /// Start an asynchronous write of queued records unless one is in flight
    pub fn drain<R: WireRecord>(&self, pipeline: &TransmitPipeline<R>) -> Result<DrainOutcome> {
        if !self.is_alive() {
            return Err(CanError::DeviceGone);
        }
        let endpoint = self.endpoints.bulk_out.address;
        pipeline.drain_and_send(&self.out_busy, |packet| {
            self.pipes.submit_write(endpoint, packet)
        })
    }

    /// Blocking bulk write; a failure tears the channel down
    pub fn write_sync(&self, endpoint: u8, data: &[u8]) -> Result<()> {
        self.pipes.count_sync_write();
        match self
            .transport
            .write_bulk(endpoint, data, self.config.usb_timeout)
        {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                error!(
                    "{}: short bulk write, {n} of {} bytes",
                    self.handle,
                    data.len()
                );
                self.teardown();
                Err(CanError::InvalidResponse {
                    expected: data.len(),
                    actual: n,
                })
            }
            Err(e) => {
                error!("{}: synchronous bulk write failed: {e}", self.handle);
                self.teardown();
                Err(CanError::BulkTransfer(e))
            }
        }
    }

    /// Write a command synchronously on the bulk-out pipe if it is idle
    ///
    /// Returns `Ok(false)` without writing when an asynchronous write is in
    /// flight; the caller queues the command instead.
    pub fn try_write_command(&self, data: &[u8]) -> Result<bool> {
        if !self.out_busy.try_acquire() {
            return Ok(false);
        }
        let result = self.write_sync(self.endpoints.command_out.address, data);
        self.out_busy.release();
        result?;
        // Records queued while we held the gate
        self.backend.drain(self)?;
        Ok(true)
    }

    /// Send a request and wait for the matching response frame
    pub fn round_trip(
        &self,
        key: ResponseKey,
        send: impl FnOnce() -> Result<()>,
    ) -> Result<Vec<u8>> {
        let waiter = self.correlator.register(key);
        send()?;
        waiter.wait(self.config.response_timeout)
    }

    /// Vendor control transfer, host to device
    pub fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize> {
        let timeout = self.config.usb_timeout;
        self.transport
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(CanError::ControlTransfer)
    }

    /// Vendor control transfer, device to host
    pub fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        let timeout = self.config.usb_timeout;
        self.transport
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(CanError::ControlTransfer)
    }

    /// Close the channel after a transport failure
    ///
    /// No further reads are armed and pending round trips fail.
    pub fn teardown(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        error!("{}: transport failure, channel closed", self.handle);
        self.pipes.shutdown();
        self.correlator.cancel_all();
        self.transport.release();
    }

    // ------------------------------------------------------------------
    // Completion handling (worker thread)
    // ------------------------------------------------------------------

    fn on_read_complete(&self, result: rusb::Result<Vec<u8>>) {
        match result {
            Ok(buf) => {
                trace!("{}: bulk in {} bytes", self.handle, buf.len());
                self.backend.process_read(self, &buf);
                if let Err(e) = self.arm_read() {
                    debug!("{}: read not re-armed: {e}", self.handle);
                }
            }
            Err(e) => {
                error!("{}: bulk in failed: {e}", self.handle);
                self.teardown();
            }
        }
    }

    fn on_write_complete(&self, result: rusb::Result<usize>) {
        match result {
            Ok(n) => {
                trace!("{}: bulk out {n} bytes done", self.handle);
                self.out_busy.release();
                if let Err(e) = self.backend.drain(self) {
                    debug!("{}: drain after write: {e}", self.handle);
                }
            }
            Err(e) => {
                // The gate stays set; nothing else is written
                error!("{}: bulk out failed: {e}", self.handle);
                self.teardown();
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("backend", &self.backend.kind())
            .field("active", &self.is_active())
            .field("alive", &self.is_alive())
            .field("fd", &self.is_fd())
            .field("chip", &self.chip_state())
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.pipes.shutdown();
    }
}

fn run_worker(weak: Weak<Device>, completions: Receiver<Completion>) {
    while let Ok(completion) = completions.recv() {
        if matches!(completion, Completion::Shutdown) {
            return;
        }
        let Some(device) = weak.upgrade() else {
            return;
        };
        if !device.is_alive() {
            trace!("{}: completion after teardown ignored", device.handle);
            continue;
        }
        match completion {
            Completion::Read(result) => device.on_read_complete(result),
            Completion::Write(result) => device.on_write_complete(result),
            Completion::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::EndpointDescriptor;
    use std::time::{Duration, Instant};

    /// Serves one bulk-in packet, then times out
    #[derive(Default)]
    struct OnePacket {
        packet: Mutex<Option<Vec<u8>>>,
        short_writes: bool,
        released: AtomicBool,
    }

    impl Transport for OnePacket {
        fn read_bulk(&self, _ep: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
            if self.released.load(Ordering::Acquire) {
                return Err(rusb::Error::NoDevice);
            }
            match lock(&self.packet).take() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                None => {
                    thread::sleep(timeout);
                    Err(rusb::Error::Timeout)
                }
            }
        }

        fn write_bulk(&self, _ep: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
            if self.short_writes {
                Ok(data.len() - 1)
            } else {
                Ok(data.len())
            }
        }

        fn read_control(
            &self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            _buf: &mut [u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            Err(rusb::Error::NotSupported)
        }

        fn write_control(
            &self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            _data: &[u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            Err(rusb::Error::NotSupported)
        }

        fn release(&self) {
            self.released.store(true, Ordering::Release);
        }
    }

    /// Backend whose receive path panics
    struct Faulty;

    impl Backend for Faulty {
        fn kind(&self) -> BackendKind {
            BackendKind::ClassicLeaf
        }

        fn init_hardware(&self, dev: &Device) -> Result<()> {
            dev.arm_read()
        }

        fn process_read(&self, _dev: &Device, _buf: &[u8]) {
            panic!("malformed buffer");
        }
    }

    fn spawn_device(transport: Arc<OnePacket>) -> Arc<Device> {
        let endpoints = Endpoints::from_descriptors(&[
            EndpointDescriptor::bulk_in(0x81, 64),
            EndpointDescriptor::bulk_out(0x02, 64),
        ])
        .unwrap();
        let config = Config::default().with_read_poll_interval(Duration::from_millis(5));
        let id = DeviceId {
            vendor_id: 0x0BFD,
            product_id: 0x0120,
            channel: 0,
        };
        Device::spawn(
            CanHandle::new(0),
            id,
            transport,
            endpoints,
            Box::new(Faulty),
            &config,
        )
        .unwrap()
    }

    #[test]
    fn test_detach_after_worker_panic() {
        let transport = Arc::new(OnePacket {
            packet: Mutex::new(Some(vec![1, 2, 3])),
            ..Default::default()
        });
        let dev = spawn_device(Arc::clone(&transport));
        dev.init_hardware().unwrap();

        let start = Instant::now();
        while !lock(&dev.worker).as_ref().is_some_and(|w| w.is_finished()) {
            assert!(start.elapsed() < Duration::from_secs(2), "worker still running");
            thread::sleep(Duration::from_millis(5));
        }

        dev.detach();
        assert!(!dev.is_active());
        assert!(lock(&dev.worker).is_none());
        assert!(matches!(dev.bus_on(), Err(CanError::InvalidHandle(0))));
    }

    #[test]
    fn test_short_sync_write_tears_down() {
        let transport = Arc::new(OnePacket {
            short_writes: true,
            ..Default::default()
        });
        let dev = spawn_device(Arc::clone(&transport));

        assert!(matches!(
            dev.write_sync(0x02, &[4, 5, 6, 7]),
            Err(CanError::InvalidResponse {
                expected: 4,
                actual: 3
            })
        ));
        assert!(!dev.is_alive());
        assert!(transport.released.load(Ordering::Acquire));
        assert!(matches!(dev.bus_on(), Err(CanError::DeviceGone)));
        dev.detach();
    }
}
