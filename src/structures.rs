//! Shared data structures
//!
//! Bus timing parameters, chip state, device information and the endpoint
//! description every backend works with.

use crate::constants::{
    CAN_NOTIFY_RX, CAN_NOTIFY_STATUS, CAN_STAT_BUS_OFF, CAN_STAT_ERROR_ACTIVE,
    CAN_STAT_ERROR_PASSIVE,
};
use crate::registry::CanHandle;

/// Nominal (arbitration phase) bus parameters
///
/// `freq` is either a bit rate in Hz or a prescaler, depending on the
/// backend's timing table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusParams {
    pub freq: i64,
    pub tseg1: u32,
    pub tseg2: u32,
    pub sjw: u32,
    pub no_samp: u32,
    pub sync_mode: u32,
}

impl BusParams {
    pub const fn new(freq: i64, tseg1: u32, tseg2: u32, sjw: u32) -> Self {
        Self {
            freq,
            tseg1,
            tseg2,
            sjw,
            no_samp: 1,
            sync_mode: 0,
        }
    }

    /// Time quanta per bit
    pub fn quanta(&self) -> u32 {
        1 + self.tseg1 + self.tseg2
    }
}

impl std::fmt::Display for BusParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "freq {} tseg1 {} tseg2 {} sjw {} samples {}",
            self.freq, self.tseg1, self.tseg2, self.sjw, self.no_samp
        )
    }
}

/// CAN FD data phase bus parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusParamsFd {
    pub freq: i64,
    pub tseg1: u32,
    pub tseg2: u32,
    pub sjw: u32,
}

impl BusParamsFd {
    pub const fn new(freq: i64, tseg1: u32, tseg2: u32, sjw: u32) -> Self {
        Self {
            freq,
            tseg1,
            tseg2,
            sjw,
        }
    }
}

impl From<BusParams> for BusParamsFd {
    fn from(params: BusParams) -> Self {
        Self::new(params.freq, params.tseg1, params.tseg2, params.sjw)
    }
}

/// Cached timing of one channel
#[derive(Debug, Clone, Copy, Default)]
pub struct BusTiming {
    pub nominal: Option<BusParams>,
    pub data: Option<BusParamsFd>,
}

/// Controller state as seen by the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusStatus {
    /// Chip not started
    #[default]
    Stopped,
    ErrorActive,
    ErrorPassive,
    BusOff,
}

impl BusStatus {
    pub fn name(&self) -> &'static str {
        match self {
            BusStatus::Stopped => "stopped",
            BusStatus::ErrorActive => "error active",
            BusStatus::ErrorPassive => "error passive",
            BusStatus::BusOff => "bus off",
        }
    }
}

/// Last known chip state and error counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChipState {
    pub status: BusStatus,
    pub tx_errors: u8,
    pub rx_errors: u8,
}

impl ChipState {
    /// canlib `canSTAT_*` flags for this state
    pub fn status_flags(&self) -> u32 {
        match self.status {
            BusStatus::ErrorActive => CAN_STAT_ERROR_ACTIVE,
            BusStatus::ErrorPassive => CAN_STAT_ERROR_PASSIVE,
            BusStatus::BusOff | BusStatus::Stopped => CAN_STAT_BUS_OFF,
        }
    }

    pub fn is_bus_off(&self) -> bool {
        self.status == BusStatus::BusOff
    }
}

impl std::fmt::Display for ChipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "State: {}\nTX Error Counter: {}\nRX Error Counter: {}",
            self.status.name(),
            self.tx_errors,
            self.rx_errors
        )
    }
}

/// Kvaser M16C / hydra bus status bits
pub const BUS_STATUS_RESET: u8 = 0x01;
pub const BUS_STATUS_ERROR: u8 = 0x10;
pub const BUS_STATUS_PASSIVE: u8 = 0x20;
pub const BUS_STATUS_OFF: u8 = 0x40;

/// Map a Kvaser bus status byte to a controller state
///
/// Returns `None` for patterns that carry no state (reset, error bit alone).
pub fn decode_bus_status(raw: u8) -> Option<BusStatus> {
    match raw {
        0 => Some(BusStatus::ErrorActive),
        BUS_STATUS_PASSIVE => Some(BusStatus::ErrorPassive),
        BUS_STATUS_OFF | 0x60 => Some(BusStatus::BusOff),
        _ => None,
    }
}

/// Static information about a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial_number: u64,
    /// `canCHANNEL_CAP_*` flags
    pub capabilities: u32,
    pub description: String,
    pub firmware_version: u32,
}

/// Answer to a channel data query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelData {
    ChannelCapabilities(u32),
    CardSerialNo(u64),
    DeviceDescription(String),
}

/// Direction of a bulk endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A bulk endpoint discovered on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit
    pub address: u8,
    pub direction: Direction,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn bulk_in(address: u8, max_packet_size: u16) -> Self {
        Self {
            address: address | 0x80,
            direction: Direction::In,
            max_packet_size,
        }
    }

    pub fn bulk_out(address: u8, max_packet_size: u16) -> Self {
        Self {
            address: address & 0x7F,
            direction: Direction::Out,
            max_packet_size,
        }
    }

    /// Same endpoint, `n` addresses further on
    pub fn offset(&self, n: u8) -> Self {
        Self {
            address: self.address.wrapping_add(n),
            ..*self
        }
    }
}

/// Endpoints a channel uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub bulk_in: EndpointDescriptor,
    pub bulk_out: EndpointDescriptor,
    /// Out endpoint for synchronous commands; equals `bulk_out` unless the
    /// adapter has a dedicated command pipe
    pub command_out: EndpointDescriptor,
}

impl Endpoints {
    /// Pick the last bulk in and last bulk out endpoint of the list
    pub fn from_descriptors(descriptors: &[EndpointDescriptor]) -> Option<Self> {
        let bulk_in = descriptors
            .iter()
            .rev()
            .find(|ep| ep.direction == Direction::In)?;
        let bulk_out = descriptors
            .iter()
            .rev()
            .find(|ep| ep.direction == Direction::Out)?;
        Some(Self {
            bulk_in: *bulk_in,
            bulk_out: *bulk_out,
            command_out: *bulk_out,
        })
    }
}

/// Posted to a registered notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub handle: CanHandle,
    /// `CAN_NOTIFY_RX` or `CAN_NOTIFY_STATUS`
    pub event: u32,
}

impl Notification {
    pub fn is_rx(&self) -> bool {
        self.event & CAN_NOTIFY_RX != 0
    }

    pub fn is_status(&self) -> bool {
        self.event & CAN_NOTIFY_STATUS != 0
    }
}
