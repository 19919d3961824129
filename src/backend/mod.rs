//! Vendor backends
//!
//! Each supported adapter family implements [`Backend`]. A device owns one
//! backend instance, which also holds the family's private state (command
//! queues, negotiated modes, addresses). Operations a family does not
//! support return [`CanError::NotImplemented`].

pub mod ixxat;
pub mod leaf;
pub mod leaf_pro;
pub mod peak;

use crate::config::Config;
use crate::constants::*;
use crate::device::Device;
use crate::error::{CanError, Result};
use crate::message::CanMsg;
use crate::structures::{BusParams, BusParamsFd, EndpointDescriptor, Endpoints};

/// Adapter family and protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Kvaser Leaf, classic CAN, length prefixed commands
    ClassicLeaf,
    /// Kvaser Leaf Pro, fixed 32 byte hydra commands
    LeafPro,
    /// Kvaser Leaf Pro with firmware supporting extended FD commands
    LeafProExtendedFd,
    /// IXXAT USB-to-CAN FD
    IxxatFd,
    /// PEAK PCAN-USB FD
    PeakFd,
}

impl BackendKind {
    /// Backend family for a USB vendor/product id
    pub fn for_product(vendor_id: u16, product_id: u16) -> Option<Self> {
        match (vendor_id, product_id) {
            (KVASER_VENDOR_ID, KVASER_LEAF_LIGHT_V2_PRODUCT_ID)
            | (KVASER_VENDOR_ID, KVASER_LEAF_SEMIPRO_HS_PRODUCT_ID) => Some(Self::ClassicLeaf),
            (KVASER_VENDOR_ID, KVASER_LEAF_PRO_HS_V2_PRODUCT_ID) => Some(Self::LeafPro),
            (IXXAT_VENDOR_ID, IXXAT_USB_TO_CAN_FD_PRODUCT_ID) => Some(Self::IxxatFd),
            (PEAK_VENDOR_ID, PEAK_USB_FD_PRODUCT_ID) => Some(Self::PeakFd),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ClassicLeaf => "Kvaser Leaf",
            Self::LeafPro => "Kvaser Leaf Pro",
            Self::LeafProExtendedFd => "Kvaser Leaf Pro (extended)",
            Self::IxxatFd => "IXXAT USB-to-CAN FD",
            Self::PeakFd => "PEAK PCAN-USB FD",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Human readable product name
pub fn product_name(vendor_id: u16, product_id: u16) -> &'static str {
    match (vendor_id, product_id) {
        (KVASER_VENDOR_ID, KVASER_LEAF_LIGHT_V2_PRODUCT_ID) => "Kvaser Leaf Light v2",
        (KVASER_VENDOR_ID, KVASER_LEAF_SEMIPRO_HS_PRODUCT_ID) => "Kvaser Leaf SemiPro HS",
        (KVASER_VENDOR_ID, KVASER_LEAF_PRO_HS_V2_PRODUCT_ID) => "Kvaser Leaf Pro HS v2",
        (IXXAT_VENDOR_ID, IXXAT_USB_TO_CAN_FD_PRODUCT_ID) => "IXXAT USB-to-CAN FD",
        (PEAK_VENDOR_ID, PEAK_USB_FD_PRODUCT_ID) => "PEAK PCAN-USB FD",
        _ => "Unknown device",
    }
}

/// Create the backend for a device
pub fn create(kind: BackendKind, config: &Config) -> Box<dyn Backend> {
    match kind {
        BackendKind::ClassicLeaf => Box::new(leaf::LeafBackend::new(config)),
        BackendKind::LeafPro | BackendKind::LeafProExtendedFd => {
            Box::new(leaf_pro::LeafProBackend::new(config))
        }
        BackendKind::IxxatFd => Box::new(ixxat::IxxatBackend::new(config)),
        BackendKind::PeakFd => Box::new(peak::PeakBackend::new(config)),
    }
}

/// Operation set every adapter family provides
///
/// Methods receive the owning [`Device`] for shared state and I/O. Calls
/// from application threads and from the device worker may overlap, so
/// implementations keep their private state behind atomics or locks.
pub trait Backend: Send + Sync {
    /// Family and, once negotiated, protocol variant
    fn kind(&self) -> BackendKind;

    /// Choose the endpoints of CAN channel `channel` on the adapter
    fn select_endpoints(
        &self,
        discovered: &[EndpointDescriptor],
        _channel: u8,
    ) -> Result<Endpoints> {
        Endpoints::from_descriptors(discovered).ok_or(CanError::NotFound)
    }

    /// Allocate private state, arm the first read and query capabilities
    fn init_hardware(&self, dev: &Device) -> Result<()>;

    /// Select classic or FD mode from the canlib open flags
    fn open_channel(&self, dev: &Device, flags: u32) -> Result<()> {
        let fd = flags & CAN_OPEN_CAN_FD != 0;
        let capabilities = dev.info().capabilities;
        if fd && capabilities & CAN_CHANNEL_CAP_CAN_FD == 0 {
            return Err(CanError::Param("channel does not support CAN FD"));
        }
        if flags & CAN_OPEN_REQUIRE_EXTENDED != 0
            && capabilities & CAN_CHANNEL_CAP_EXTENDED_CAN == 0
        {
            return Err(CanError::Param("channel does not support extended ids"));
        }
        dev.set_fd(fd);
        Ok(())
    }

    fn set_bus_params(&self, _dev: &Device, _params: BusParams) -> Result<()> {
        Err(CanError::NotImplemented("set bus params"))
    }

    fn set_bus_params_fd(&self, _dev: &Device, _params: BusParamsFd) -> Result<()> {
        Err(CanError::NotImplemented("set FD bus params"))
    }

    fn bus_on(&self, _dev: &Device) -> Result<()> {
        Err(CanError::NotImplemented("bus on"))
    }

    fn bus_off(&self, _dev: &Device) -> Result<()> {
        Err(CanError::NotImplemented("bus off"))
    }

    /// Queue a CAN message for transmission without blocking
    fn write(
        &self,
        _dev: &Device,
        _id: u32,
        _payload: &[u8],
        _dlc: usize,
        _flags: u32,
    ) -> Result<()> {
        Err(CanError::NotImplemented("write"))
    }

    /// Take the oldest decoded message
    fn read(&self, dev: &Device) -> Result<CanMsg> {
        dev.pop_event()
    }

    /// Release private state
    fn close(&self, dev: &Device) -> Result<()> {
        dev.clear_events();
        Ok(())
    }

    /// Decode one completed bulk-in buffer (device worker)
    fn process_read(&self, dev: &Device, buf: &[u8]);

    /// Start the next asynchronous write of queued records, if any
    fn drain(&self, _dev: &Device) -> Result<()> {
        Ok(())
    }
}

/// Look up a symbolic bitrate in a backend timing table
pub(crate) fn lookup_timing<T: Copy>(table: &[(i64, T)], bitrate: i64) -> Result<T> {
    table
        .iter()
        .find(|(symbol, _)| *symbol == bitrate)
        .map(|(_, timing)| *timing)
        .ok_or(CanError::Param("unsupported bitrate"))
}

/// 48-bit little endian tick counter from three 16-bit words
pub(crate) fn ticks48(words: [u16; 3]) -> u64 {
    (words[0] as u64) | ((words[1] as u64) << 16) | ((words[2] as u64) << 32)
}
