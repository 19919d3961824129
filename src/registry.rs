//! Channel registry
//!
//! The [`Registry`] owns every attached channel and hands out [`CanHandle`]s,
//! the canlib style integer handles. Slots are never reused, so a stale
//! handle keeps failing after its adapter was detached.

use std::sync::mpsc::Sender;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::backend::{self, BackendKind};
use crate::config::Config;
use crate::device::{Device, DeviceId};
use crate::error::{CanError, Result};
use crate::message::CanMsg;
use crate::pipeline::PipeStats;
use crate::structures::{
    BusParams, BusParamsFd, ChannelData, DeviceInfo, EndpointDescriptor, Notification,
};
use crate::transport::{RusbTransport, Transport};

/// Handle of one logical CAN channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanHandle(usize);

impl CanHandle {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for CanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "can{}", self.0)
    }
}

#[derive(Clone)]
struct Slot {
    device: Arc<Device>,
    transport: Arc<dyn Transport>,
}

/// Table of attached channels
///
/// ```no_run
/// use canlib_usb::{Config, Registry, CAN_BITRATE_500K, CAN_MSG_STD};
///
/// # fn main() -> canlib_usb::Result<()> {
/// let registry = Registry::new(Config::default());
/// registry.scan()?;
/// let handle = registry.open_channel(0, 0)?;
/// registry.set_bus_params(handle, CAN_BITRATE_500K, 0, 0, 0, 0, 0)?;
/// registry.bus_on(handle)?;
/// registry.write(handle, 0x123, &[1, 2, 3], 3, CAN_MSG_STD)?;
/// # Ok(())
/// # }
/// ```
pub struct Registry {
    config: Config,
    /// `None` marks a slot reserved by an attach in progress or one that failed
    slots: RwLock<Vec<Option<Slot>>>,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Vec<Option<Slot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Vec<Option<Slot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self) -> Result<CanHandle> {
        let mut slots = self.write_slots();
        if slots.len() >= self.config.max_channels {
            return Err(CanError::NoChannels);
        }
        slots.push(None);
        Ok(CanHandle(slots.len() - 1))
    }

    fn unreserve(&self, handle: CanHandle) {
        let mut slots = self.write_slots();
        if slots.len() == handle.0 + 1 && slots[handle.0].is_none() {
            slots.pop();
        }
    }

    fn publish(&self, handle: CanHandle, slot: Slot) {
        if let Some(entry) = self.write_slots().get_mut(handle.0) {
            *entry = Some(slot);
        }
    }

    /// Active device behind a handle
    fn device(&self, handle: CanHandle) -> Result<Arc<Device>> {
        self.read_slots()
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .filter(|slot| slot.device.is_active())
            .map(|slot| Arc::clone(&slot.device))
            .ok_or(CanError::InvalidHandle(handle.0))
    }

    /// Create, spawn and initialise one channel in a reserved slot
    fn attach_channel(
        &self,
        transport: &Arc<dyn Transport>,
        vendor_id: u16,
        product_id: u16,
        discovered: &[EndpointDescriptor],
        channel: u8,
        channel_count: u8,
    ) -> Result<Arc<Device>> {
        let kind = BackendKind::for_product(vendor_id, product_id).ok_or(CanError::NotFound)?;
        let backend = backend::create(kind, &self.config);
        let endpoints = backend.select_endpoints(discovered, channel)?;

        let handle = self.reserve()?;
        let id = DeviceId {
            vendor_id,
            product_id,
            channel,
        };
        let device = match Device::spawn(
            handle,
            id,
            Arc::clone(transport),
            endpoints,
            backend,
            &self.config,
        ) {
            Ok(device) => device,
            Err(e) => {
                self.unreserve(handle);
                return Err(e);
            }
        };
        device.set_channel_count(channel_count);

        if let Err(e) = device.init_hardware() {
            warn!("{handle}: init failed: {e}");
            device.detach();
            self.unreserve(handle);
            return Err(e);
        }

        // Published only now, with the protocol variant settled
        self.publish(
            handle,
            Slot {
                device: Arc::clone(&device),
                transport: Arc::clone(transport),
            },
        );
        info!(
            "{handle}: {} ({})",
            device.info().description,
            device.backend_kind()
        );
        Ok(device)
    }

    /// Attach an adapter; returns the handle of its first channel
    ///
    /// Adapters reporting several CAN channels get one handle per channel,
    /// numbered consecutively.
    pub fn attach(
        &self,
        transport: Arc<dyn Transport>,
        vendor_id: u16,
        product_id: u16,
        endpoints: &[EndpointDescriptor],
    ) -> Result<CanHandle> {
        let first = self.attach_channel(&transport, vendor_id, product_id, endpoints, 0, 1)?;
        let count = first.channel_count();
        for channel in 1..count {
            if let Err(e) =
                self.attach_channel(&transport, vendor_id, product_id, endpoints, channel, count)
            {
                warn!("{}: channel {channel} not attached: {e}", first.handle());
                break;
            }
        }
        Ok(first.handle())
    }

    /// Attach every supported adapter found on the USB buses
    pub fn scan(&self) -> Result<Vec<CanHandle>> {
        let mut handles = Vec::new();
        for adapter in RusbTransport::scan()? {
            let transport: Arc<dyn Transport> = Arc::new(adapter.transport);
            match self.attach(
                Arc::clone(&transport),
                adapter.vendor_id,
                adapter.product_id,
                &adapter.endpoints,
            ) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(
                        "{:04x}:{:04x}: attach failed: {e}",
                        adapter.vendor_id, adapter.product_id
                    );
                    transport.release();
                }
            }
        }
        Ok(handles)
    }

    /// Remove the adapter behind `handle`, with all its channels
    pub fn detach(&self, handle: CanHandle) -> Result<()> {
        let transport = self
            .read_slots()
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .filter(|slot| slot.device.is_active())
            .map(|slot| Arc::clone(&slot.transport))
            .ok_or(CanError::InvalidHandle(handle.0))?;

        let siblings: Vec<Arc<Device>> = self
            .read_slots()
            .iter()
            .flatten()
            .filter(|slot| Arc::ptr_eq(&slot.transport, &transport))
            .filter(|slot| slot.device.is_active())
            .map(|slot| Arc::clone(&slot.device))
            .collect();
        for device in siblings {
            device.detach();
        }
        transport.release();
        debug!("{handle}: adapter detached");
        Ok(())
    }

    /// Handles of all attached channels
    pub fn handles(&self) -> Vec<CanHandle> {
        self.read_slots()
            .iter()
            .flatten()
            .filter(|slot| slot.device.is_active())
            .map(|slot| slot.device.handle())
            .collect()
    }

    pub fn number_of_channels(&self) -> usize {
        self.handles().len()
    }

    /// Open channel number `channel` in classic or FD mode
    pub fn open_channel(&self, channel: usize, flags: u32) -> Result<CanHandle> {
        let handle = CanHandle(channel);
        let device = self.device(handle).map_err(|_| CanError::NotFound)?;
        device.open_channel(flags)?;
        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_bus_params(
        &self,
        handle: CanHandle,
        freq: i64,
        tseg1: u32,
        tseg2: u32,
        sjw: u32,
        no_samp: u32,
        sync_mode: u32,
    ) -> Result<()> {
        let params = BusParams {
            freq,
            tseg1,
            tseg2,
            sjw,
            no_samp,
            sync_mode,
        };
        self.device(handle)?.set_bus_params(params)
    }

    pub fn set_bus_params_fd(
        &self,
        handle: CanHandle,
        freq: i64,
        tseg1: u32,
        tseg2: u32,
        sjw: u32,
    ) -> Result<()> {
        self.device(handle)?
            .set_bus_params_fd(BusParamsFd::new(freq, tseg1, tseg2, sjw))
    }

    pub fn bus_on(&self, handle: CanHandle) -> Result<()> {
        self.device(handle)?.bus_on()
    }

    pub fn bus_off(&self, handle: CanHandle) -> Result<()> {
        self.device(handle)?.bus_off()
    }

    /// Queue a message; `dlc` is the frame length in bytes
    pub fn write(
        &self,
        handle: CanHandle,
        id: u32,
        payload: &[u8],
        dlc: usize,
        flags: u32,
    ) -> Result<()> {
        self.device(handle)?.write(id, payload, dlc, flags)
    }

    /// Take the oldest received message; `NoMsg` when none is buffered
    pub fn read(&self, handle: CanHandle) -> Result<CanMsg> {
        self.device(handle)?.read()
    }

    /// canlib `canSTAT_*` flags
    pub fn read_status(&self, handle: CanHandle) -> Result<u32> {
        self.device(handle)?.read_status()
    }

    pub fn channel_data(&self, handle: CanHandle, item: i32) -> Result<ChannelData> {
        self.device(handle)?.channel_data(item)
    }

    pub fn device_info(&self, handle: CanHandle) -> Result<DeviceInfo> {
        Ok(self.device(handle)?.info())
    }

    /// Post `CAN_NOTIFY_*` events selected by `flags` to `sender`; `None` clears
    pub fn set_notify(
        &self,
        handle: CanHandle,
        sender: Option<Sender<Notification>>,
        flags: u32,
    ) -> Result<()> {
        self.device(handle)?.set_notify(sender, flags);
        Ok(())
    }

    pub fn backend_kind(&self, handle: CanHandle) -> Result<BackendKind> {
        Ok(self.device(handle)?.backend_kind())
    }

    pub fn pipe_stats(&self, handle: CanHandle) -> Result<PipeStats> {
        Ok(self.device(handle)?.pipe_stats())
    }

    /// Request/response round trips still waiting for an answer
    pub fn pending_requests(&self, handle: CanHandle) -> Result<usize> {
        Ok(self.device(handle)?.correlator().pending())
    }

    pub fn close(&self, handle: CanHandle) -> Result<()> {
        self.device(handle)?.close()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("channels", &self.handles())
            .finish()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let slots: Vec<Slot> = self.write_slots().drain(..).flatten().collect();
        for slot in &slots {
            if slot.device.is_active() {
                slot.device.detach();
            }
        }
        for slot in &slots {
            slot.transport.release();
        }
    }
}
