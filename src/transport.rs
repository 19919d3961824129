//! USB transport primitives
//!
//! Backends talk to the hardware only through [`Transport`], which keeps the
//! protocol code independent of the USB stack and lets tests substitute a
//! scripted device. [`RusbTransport`] is the libusb implementation.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use log::{debug, warn};
use rusb::{DeviceHandle, Direction as UsbDirection, GlobalContext, TransferType};

use crate::backend::BackendKind;
use crate::error::{CanError, Result};
use crate::structures::{Direction, EndpointDescriptor};

/// Bulk and control transfer primitives keyed by endpoint address
///
/// Implementations must be callable from several threads at once: the
/// reader thread blocks in [`read_bulk`](Transport::read_bulk) while the
/// writer thread and application threads issue writes.
pub trait Transport: Send + Sync {
    /// Read from a bulk in endpoint; `Err(rusb::Error::Timeout)` means no data yet
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    /// Write to a bulk out endpoint
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Control transfer, device to host
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Control transfer, host to device
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Close the device and release the interface; later transfers fail
    fn release(&self);
}

/// A supported adapter found by [`RusbTransport::scan`]
pub struct UsbAdapter {
    pub transport: RusbTransport,
    pub vendor_id: u16,
    pub product_id: u16,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl std::fmt::Debug for UsbAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbAdapter")
            .field("vendor_id", &format_args!("0x{:04x}", self.vendor_id))
            .field("product_id", &format_args!("0x{:04x}", self.product_id))
            .field("bus", &self.transport.bus)
            .field("address", &self.transport.address)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// libusb backed transport
pub struct RusbTransport {
    /// `None` once released
    handle: RwLock<Option<DeviceHandle<GlobalContext>>>,
    interface: u8,
    bus: u8,
    address: u8,
}

impl RusbTransport {
    /// Claim `interface` on an opened device
    pub fn new(mut handle: DeviceHandle<GlobalContext>, interface: u8) -> Result<Self> {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(interface).unwrap_or(false) {
                handle.detach_kernel_driver(interface)?;
            }
        }
        handle.claim_interface(interface)?;

        let device = handle.device();
        let (bus, address) = (device.bus_number(), device.address());
        debug!("claimed interface {interface} on bus {bus} addr {address}");

        Ok(Self {
            handle: RwLock::new(Some(handle)),
            interface,
            bus,
            address,
        })
    }

    /// USB bus number
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// USB device address
    pub fn address(&self) -> u8 {
        self.address
    }

    fn with_handle<R>(
        &self,
        f: impl FnOnce(&DeviceHandle<GlobalContext>) -> rusb::Result<R>,
    ) -> rusb::Result<R> {
        let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(handle) => f(handle),
            None => Err(rusb::Error::NoDevice),
        }
    }

    /// Bulk endpoints of the first interface of the active configuration
    fn bulk_endpoints(device: &rusb::Device<GlobalContext>) -> Result<Vec<EndpointDescriptor>> {
        let config = device.active_config_descriptor()?;
        let mut endpoints = Vec::new();

        if let Some(interface) = config.interfaces().next() {
            if let Some(setting) = interface.descriptors().next() {
                for ep in setting.endpoint_descriptors() {
                    if ep.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    let direction = match ep.direction() {
                        UsbDirection::In => Direction::In,
                        UsbDirection::Out => Direction::Out,
                    };
                    endpoints.push(EndpointDescriptor {
                        address: ep.address(),
                        direction,
                        max_packet_size: ep.max_packet_size(),
                    });
                }
            }
        }

        Ok(endpoints)
    }

    /// Open every connected adapter with a known vendor/product id
    ///
    /// Devices that cannot be opened or claimed are skipped with a warning.
    pub fn scan() -> Result<Vec<UsbAdapter>> {
        let mut adapters = Vec::new();

        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            let (vendor_id, product_id) = (desc.vendor_id(), desc.product_id());
            if BackendKind::for_product(vendor_id, product_id).is_none() {
                continue;
            }

            let endpoints = match Self::bulk_endpoints(&device) {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    warn!("{vendor_id:04x}:{product_id:04x}: cannot read endpoints: {e}");
                    continue;
                }
            };
            let transport = match device
                .open()
                .map_err(CanError::from)
                .and_then(|handle| Self::new(handle, 0))
            {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("{vendor_id:04x}:{product_id:04x}: cannot open: {e}");
                    continue;
                }
            };

            adapters.push(UsbAdapter {
                transport,
                vendor_id,
                product_id,
                endpoints,
            });
        }

        Ok(adapters)
    }
}

impl Transport for RusbTransport {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.with_handle(|h| h.read_bulk(endpoint, buf, timeout))
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.with_handle(|h| h.write_bulk(endpoint, data, timeout))
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.with_handle(|h| h.read_control(request_type, request, value, index, buf, timeout))
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.with_handle(|h| h.write_control(request_type, request, value, index, data, timeout))
    }

    fn release(&self) {
        let mut guard = self.handle.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut handle) = guard.take() {
            if let Err(e) = handle.release_interface(self.interface) {
                debug!("release interface {}: {e}", self.interface);
            }
        }
    }
}

impl std::fmt::Debug for RusbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusbTransport")
            .field("bus", &self.bus)
            .field("address", &self.address)
            .field("interface", &self.interface)
            .finish()
    }
}
