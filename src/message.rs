//! Decoded CAN message record and DLC helpers
//!
//! [`CanMsg`] is the backend independent representation every receive
//! pipeline produces and the event buffer stores. DLC helpers translate
//! between CAN FD length codes and byte counts.

use crate::constants::{
    CANFD_DLC_TO_LEN, CANFD_MAX_DLEN, CANFD_MSG_BRS, CANFD_MSG_FDF, CAN_EFF_MASK, CAN_MAX_DLEN,
    CAN_MSG_ERROR_FRAME, CAN_MSG_EXT, CAN_MSG_RTR, CAN_MSG_TXACK, INVALID_DLC,
};
use crate::error::{CanError, Result};

/// Convert an FD data length code to its byte count
///
/// Only the low nibble is used, so every input maps to a valid length.
pub fn decode_fd_dlc(code: u8) -> usize {
    CANFD_DLC_TO_LEN[(code & 0x0F) as usize]
}

/// Convert a byte count to its FD data length code
///
/// Returns [`INVALID_DLC`] for lengths above 8 that are not one of
/// 12, 16, 20, 24, 32, 48 or 64.
pub fn encode_fd_dlc(length: usize) -> u8 {
    if length <= CAN_MAX_DLEN {
        return length as u8;
    }
    CANFD_DLC_TO_LEN
        .iter()
        .skip(CAN_MAX_DLEN + 1)
        .position(|&len| len == length)
        .map(|pos| (pos + CAN_MAX_DLEN + 1) as u8)
        .unwrap_or(INVALID_DLC)
}

/// Validate a canlib `dlc` against the message flags and return the payload
/// length in bytes
///
/// Classic frames accept 0..=8. FD frames (`CANFD_MSG_FDF`) accept any length
/// that has an FD length code.
pub fn payload_len(dlc: usize, flags: u32) -> Result<usize> {
    if flags & CANFD_MSG_FDF != 0 {
        if encode_fd_dlc(dlc) == INVALID_DLC {
            return Err(CanError::Param("dlc has no CAN FD length code"));
        }
    } else if dlc > CAN_MAX_DLEN {
        return Err(CanError::Param("dlc exceeds 8 bytes for a classic frame"));
    }
    Ok(dlc)
}

/// Copy up to `len` payload bytes into a zero padded FD sized array
///
/// A payload shorter than `len` is padded with zeros.
pub(crate) fn copy_payload(payload: &[u8], len: usize) -> [u8; CANFD_MAX_DLEN] {
    let mut data = [0u8; CANFD_MAX_DLEN];
    let n = payload.len().min(len).min(CANFD_MAX_DLEN);
    data[..n].copy_from_slice(&payload[..n]);
    data
}

pub(crate) fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn le_u64(buf: &[u8], offset: usize) -> u64 {
    (le_u32(buf, offset) as u64) | ((le_u32(buf, offset + 4) as u64) << 32)
}

/// Decoded CAN message
///
/// `flags` carries canlib `canMSG_*` and `canFDMSG_*` bits and `dlc` is the
/// payload length in bytes, as returned by canlib's `canRead`.
#[derive(Clone, PartialEq, Eq)]
pub struct CanMsg {
    /// CAN identifier without flag bits
    pub id: u32,
    /// canlib message flags
    pub flags: u32,
    /// Payload length in bytes
    pub dlc: u8,
    /// Payload, zero padded to 64 bytes
    pub data: [u8; CANFD_MAX_DLEN],
    /// Timestamp in the backend's native unit
    pub timestamp: u64,
}

impl Default for CanMsg {
    fn default() -> Self {
        Self {
            id: 0,
            flags: 0,
            dlc: 0,
            data: [0u8; CANFD_MAX_DLEN],
            timestamp: 0,
        }
    }
}

impl CanMsg {
    /// Create a message from an identifier, payload and flags
    ///
    /// The payload is truncated to 64 bytes.
    pub fn new(id: u32, payload: &[u8], flags: u32) -> Self {
        let len = payload.len().min(CANFD_MAX_DLEN);
        let mut msg = Self {
            id: id & CAN_EFF_MASK,
            flags,
            dlc: len as u8,
            ..Self::default()
        };
        msg.data[..len].copy_from_slice(&payload[..len]);
        msg
    }

    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.dlc as usize).min(CANFD_MAX_DLEN)]
    }

    pub fn is_extended_id(&self) -> bool {
        self.flags & CAN_MSG_EXT != 0
    }

    pub fn is_remote_frame(&self) -> bool {
        self.flags & CAN_MSG_RTR != 0
    }

    pub fn is_error_frame(&self) -> bool {
        self.flags & CAN_MSG_ERROR_FRAME != 0
    }

    pub fn is_fd(&self) -> bool {
        self.flags & CANFD_MSG_FDF != 0
    }

    pub fn is_brs(&self) -> bool {
        self.flags & CANFD_MSG_BRS != 0
    }

    /// Check if this is the echo of a frame sent by this channel
    pub fn is_tx_ack(&self) -> bool {
        self.flags & CAN_MSG_TXACK != 0
    }
}

impl std::fmt::Display for CanMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fd_indicator = if self.is_fd() { " FD" } else { "" };
        let brs_indicator = if self.is_brs() { " BRS" } else { "" };

        let data_str = if self.is_remote_frame() {
            "remote request".to_string()
        } else {
            self.payload()
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        };

        write!(
            f,
            "{:>8X}{}{}   [{}]  {}",
            self.id, fd_indicator, brs_indicator, self.dlc, data_str
        )
    }
}

impl std::fmt::Debug for CanMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanMsg")
            .field("id", &format_args!("0x{:08X}", self.id))
            .field("flags", &format_args!("0x{:06X}", self.flags))
            .field("dlc", &self.dlc)
            .field("payload", &self.payload())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
