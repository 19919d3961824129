//! canlib compatible driver core for USB CAN adapters
//!
//! This crate talks to Kvaser, IXXAT and PEAK USB CAN interfaces through
//! libusb and exposes the familiar canlib operation set: open a channel, set
//! bus parameters, go bus on, write and read messages.
//!
//! # Features
//!
//! - Classic CAN and CAN FD (Leaf Pro, IXXAT USB-to-CAN FD, PCAN-USB FD)
//! - Asynchronous bulk pipelines with one completion worker per channel
//! - Request/response correlation with bounded waits
//! - canlib status codes for every error
//! - Bus state and error counter tracking, receive and status notifications
//!
//! # Example
//!
//! ```no_run
//! use canlib_usb::{CanError, Config, Registry, CAN_BITRATE_250K, CAN_MSG_STD};
//! use std::thread;
//! use std::time::Duration;
//!
//! fn main() -> canlib_usb::Result<()> {
//!     let registry = Registry::new(Config::default());
//!     if registry.scan()?.is_empty() {
//!         println!("No supported adapter found");
//!         return Ok(());
//!     }
//!
//!     let handle = registry.open_channel(0, 0)?;
//!     registry.set_bus_params(handle, CAN_BITRATE_250K, 0, 0, 0, 0, 0)?;
//!     registry.bus_on(handle)?;
//!
//!     let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
//!     registry.write(handle, 0x7FF, &data, data.len(), CAN_MSG_STD)?;
//!
//!     loop {
//!         match registry.read(handle) {
//!             Ok(msg) => println!("RX  {}", msg),
//!             Err(CanError::NoMsg) => thread::sleep(Duration::from_millis(10)),
//!             Err(e) => return Err(e),
//!         }
//!     }
//! }
//! ```
//!
//! # Supported Devices
//!
//! - Kvaser Leaf Light v2 (VID: 0x0BFD, PID: 0x0120)
//! - Kvaser Leaf SemiPro HS (VID: 0x0BFD, PID: 0x000E)
//! - Kvaser Leaf Pro HS v2 (VID: 0x0BFD, PID: 0x0107)
//! - IXXAT USB-to-CAN FD (VID: 0x08D8, PID: 0x0014)
//! - PEAK PCAN-USB FD (VID: 0x0C72, PID: 0x0012)

pub mod backend;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod device;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod registry;
pub mod ring_buffer;
pub mod structures;
pub mod transport;

// Re-export main types at crate root
pub use constants::*;

pub use backend::{Backend, BackendKind};
pub use config::Config;
pub use device::{Device, DeviceId};
pub use error::{CanError, CanStatus, Result};
pub use message::{decode_fd_dlc, encode_fd_dlc, CanMsg};
pub use pipeline::PipeStats;
pub use registry::{CanHandle, Registry};
pub use structures::{
    BusParams, BusParamsFd, BusStatus, ChannelData, ChipState, DeviceInfo, Direction,
    EndpointDescriptor, Endpoints, Notification,
};
pub use transport::{RusbTransport, Transport, UsbAdapter};
