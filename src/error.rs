//! Error types for the CAN driver core
//!
//! Every failure is an explicit [`CanError`]. [`CanError::status`] maps it to
//! the canlib status enumerant, so a canlib style facade can hand plain
//! integers back to its callers.

use thiserror::Error;

use crate::constants::*;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, CanError>;

/// Error types for driver operations
#[derive(Error, Debug)]
pub enum CanError {
    /// USB error from the rusb library
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Invalid parameter (bitrate, DLC, payload, flags)
    #[error("Invalid parameter: {0}")]
    Param(&'static str),

    /// The event buffer holds no message
    #[error("No message available")]
    NoMsg,

    /// No matching device or channel
    #[error("Device or channel not found")]
    NotFound,

    /// Buffer allocation failed
    #[error("Out of memory")]
    NoMemory,

    /// The registry has no free slot
    #[error("No channels available")]
    NoChannels,

    /// A request/response round trip did not complete in time
    #[error("Timed out waiting for response")]
    Timeout,

    /// The channel has not been initialized
    #[error("Channel not initialized")]
    NotInitialized,

    /// Handle does not refer to an active channel
    #[error("Invalid handle: {0}")]
    InvalidHandle(usize),

    /// Outbound command queue is full
    #[error("Transmit buffer overflow")]
    TxBufferOverflow,

    /// The adapter rejected a command
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Operation not available for this backend
    #[error("Operation not implemented: {0}")]
    NotImplemented(&'static str),

    /// Internal error (thread spawn, broken channel)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel was torn down after a transport failure or removal
    #[error("Device is gone")]
    DeviceGone,

    /// Invalid response from device
    #[error("Invalid response from device: expected {expected} bytes, got {actual}")]
    InvalidResponse { expected: usize, actual: usize },

    /// Control transfer failed
    #[error("Control transfer failed: {0}")]
    ControlTransfer(rusb::Error),

    /// Bulk transfer failed
    #[error("Bulk transfer failed: {0}")]
    BulkTransfer(rusb::Error),
}

impl CanError {
    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CanError::Timeout
                | CanError::Usb(rusb::Error::Timeout)
                | CanError::ControlTransfer(rusb::Error::Timeout)
                | CanError::BulkTransfer(rusb::Error::Timeout)
        )
    }

    /// Check if this error is a USB error
    pub fn is_usb_error(&self) -> bool {
        matches!(
            self,
            CanError::Usb(_) | CanError::ControlTransfer(_) | CanError::BulkTransfer(_)
        )
    }

    /// Check if this error only means the event buffer is empty
    pub fn is_no_message(&self) -> bool {
        matches!(self, CanError::NoMsg)
    }

    /// canlib status code for this error
    pub fn status(&self) -> CanStatus {
        CanStatus::from(self)
    }
}

/// canlib status enumerant
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanStatus {
    Ok = CAN_OK,
    ErrParam = CAN_ERR_PARAM,
    ErrNoMsg = CAN_ERR_NOMSG,
    ErrNotFound = CAN_ERR_NOTFOUND,
    ErrNoMem = CAN_ERR_NOMEM,
    ErrNoChannels = CAN_ERR_NOCHANNELS,
    ErrTimeout = CAN_ERR_TIMEOUT,
    ErrNotInitialized = CAN_ERR_NOTINITIALIZED,
    ErrInvHandle = CAN_ERR_INVHANDLE,
    ErrDriver = CAN_ERR_DRIVER,
    ErrTxBufOfl = CAN_ERR_TXBUFOFL,
    ErrHardware = CAN_ERR_HARDWARE,
    ErrNoCard = CAN_ERR_NOCARD,
    ErrInternal = CAN_ERR_INTERNAL,
    ErrNotImplemented = CAN_ERR_NOT_IMPLEMENTED,
}

impl CanStatus {
    /// Collapse an operation result into its status code
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => CanStatus::Ok,
            Err(e) => e.status(),
        }
    }

    /// Raw canlib value
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&CanError> for CanStatus {
    fn from(err: &CanError) -> Self {
        match err {
            CanError::Param(_) => CanStatus::ErrParam,
            CanError::NoMsg => CanStatus::ErrNoMsg,
            CanError::NotFound => CanStatus::ErrNotFound,
            CanError::NoMemory => CanStatus::ErrNoMem,
            CanError::NoChannels => CanStatus::ErrNoChannels,
            CanError::Timeout => CanStatus::ErrTimeout,
            CanError::NotInitialized => CanStatus::ErrNotInitialized,
            CanError::InvalidHandle(_) => CanStatus::ErrInvHandle,
            CanError::TxBufferOverflow => CanStatus::ErrTxBufOfl,
            CanError::Hardware(_) => CanStatus::ErrHardware,
            CanError::NotImplemented(_) => CanStatus::ErrNotImplemented,
            CanError::Internal(_) => CanStatus::ErrInternal,
            CanError::DeviceGone => CanStatus::ErrNoCard,
            CanError::InvalidResponse { .. } => CanStatus::ErrHardware,
            CanError::Usb(rusb::Error::Timeout)
            | CanError::ControlTransfer(rusb::Error::Timeout)
            | CanError::BulkTransfer(rusb::Error::Timeout) => CanStatus::ErrTimeout,
            CanError::Usb(rusb::Error::NoDevice)
            | CanError::ControlTransfer(rusb::Error::NoDevice)
            | CanError::BulkTransfer(rusb::Error::NoDevice) => CanStatus::ErrNoCard,
            CanError::Usb(_) | CanError::ControlTransfer(_) | CanError::BulkTransfer(_) => {
                CanStatus::ErrDriver
            }
        }
    }
}
