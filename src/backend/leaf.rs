//! Kvaser Leaf (classic CAN)
//!
//! Commands are length prefixed records of at most 32 bytes. Control
//! commands are written synchronously when the bulk-out pipe is idle and
//! queued otherwise; CAN messages are always queued and drained by
//! asynchronous writes padded to the max packet size.

use std::sync::OnceLock;

use log::{debug, trace, warn};

use crate::backend::{lookup_timing, product_name, ticks48, Backend, BackendKind};
use crate::config::Config;
use crate::constants::*;
use crate::correlator::ResponseKey;
use crate::device::Device;
use crate::error::{CanError, Result};
use crate::message::{copy_payload, le_u16, le_u32, payload_len, CanMsg};
use crate::pipeline::{TransmitPipeline, WireRecord};
use crate::structures::{decode_bus_status, BusParams};

// ============================================================================
// Command numbers
// ============================================================================

pub const CMD_RX_STD_MESSAGE: u8 = 12;
pub const CMD_TX_STD_MESSAGE: u8 = 13;
pub const CMD_RX_EXT_MESSAGE: u8 = 14;
pub const CMD_TX_EXT_MESSAGE: u8 = 15;
pub const CMD_SET_BUSPARAMS_REQ: u8 = 16;
pub const CMD_CHIP_STATE_EVENT: u8 = 20;
pub const CMD_START_CHIP_REQ: u8 = 26;
pub const CMD_START_CHIP_RESP: u8 = 27;
pub const CMD_STOP_CHIP_REQ: u8 = 28;
pub const CMD_STOP_CHIP_RESP: u8 = 29;
pub const CMD_GET_CARD_INFO_REQ: u8 = 34;
pub const CMD_GET_CARD_INFO_RESP: u8 = 35;
pub const CMD_GET_SOFTWARE_INFO_REQ: u8 = 38;
pub const CMD_GET_SOFTWARE_INFO_RESP: u8 = 39;
pub const CMD_TX_ACKNOWLEDGE: u8 = 50;
pub const CMD_LOG_MESSAGE: u8 = 106;

// Message flags
pub const MSG_FLAG_ERROR_FRAME: u8 = 0x01;
pub const MSG_FLAG_OVERRUN: u8 = 0x02;
pub const MSG_FLAG_NERR: u8 = 0x04;
pub const MSG_FLAG_WAKEUP: u8 = 0x08;
pub const MSG_FLAG_REMOTE_FRAME: u8 = 0x10;
pub const MSG_FLAG_TXACK: u8 = 0x40;
pub const MSG_FLAG_TXRQ: u8 = 0x80;

/// Extended identifier marker in log message idents
pub const EXT_MSG: u32 = 0x8000_0000;

pub const CMD_MAX_LEN: usize = 32;
const TX_MESSAGE_LEN: u8 = 20;
const SET_BUSPARAMS_LEN: u8 = 12;

/// Controller clock
const CLOCK_HZ: i64 = 16_000_000;
/// Tick rate of the hardware timestamp in MHz
const TIMESTAMP_MHZ: u64 = 24;
/// Receive loop bound per bulk-in buffer
const MAX_FRAMES_PER_READ: usize = 512;
const RX_ALIGN: usize = 512;

/// Symbolic bitrate to (bit rate, tseg1, tseg2, sjw)
const TIMINGS: [(i64, BusParams); 9] = [
    (CAN_BITRATE_1M, BusParams::new(1_000_000, 4, 3, 1)),
    (CAN_BITRATE_500K, BusParams::new(500_000, 4, 3, 1)),
    (CAN_BITRATE_250K, BusParams::new(250_000, 4, 3, 1)),
    (CAN_BITRATE_125K, BusParams::new(125_000, 10, 5, 1)),
    (CAN_BITRATE_100K, BusParams::new(100_000, 10, 5, 1)),
    (CAN_BITRATE_83K, BusParams::new(83_333, 5, 2, 2)),
    (CAN_BITRATE_62K, BusParams::new(62_500, 10, 5, 1)),
    (CAN_BITRATE_50K, BusParams::new(50_000, 10, 5, 1)),
    (CAN_BITRATE_10K, BusParams::new(10_000, 11, 4, 1)),
];

// ============================================================================
// Wire records
// ============================================================================

/// One outbound Leaf command, `bytes[0]` holds its length
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LeafCommand {
    bytes: [u8; CMD_MAX_LEN],
}

impl LeafCommand {
    fn new(len: u8, cmd: u8) -> Self {
        let mut bytes = [0u8; CMD_MAX_LEN];
        bytes[0] = len;
        bytes[1] = cmd;
        Self { bytes }
    }

    pub fn cmd_no(&self) -> u8 {
        self.bytes[1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.bytes[0] as usize]
    }

    /// START_CHIP_REQ or STOP_CHIP_REQ
    pub fn chip(cmd: u8, trans_id: u8, channel: u8) -> Self {
        let mut c = Self::new(4, cmd);
        c.bytes[2] = trans_id;
        c.bytes[3] = channel;
        c
    }

    pub fn get_card_info(trans_id: u8) -> Self {
        let mut c = Self::new(4, CMD_GET_CARD_INFO_REQ);
        c.bytes[2] = trans_id;
        // dataLevel
        c.bytes[3] = 0;
        c
    }

    pub fn get_software_info(trans_id: u8) -> Self {
        let mut c = Self::new(4, CMD_GET_SOFTWARE_INFO_REQ);
        c.bytes[2] = trans_id;
        c
    }

    pub fn set_bus_params(trans_id: u8, channel: u8, params: &BusParams) -> Self {
        let mut c = Self::new(SET_BUSPARAMS_LEN, CMD_SET_BUSPARAMS_REQ);
        c.bytes[2] = trans_id;
        c.bytes[3] = channel;
        c.bytes[4..8].copy_from_slice(&(params.freq as u32).to_le_bytes());
        c.bytes[8] = params.tseg1 as u8;
        c.bytes[9] = params.tseg2 as u8;
        c.bytes[10] = params.sjw as u8;
        c.bytes[11] = params.no_samp as u8;
        c
    }

    /// TX_STD_MESSAGE or TX_EXT_MESSAGE with the identifier bit packed
    pub fn tx_message(
        channel: u8,
        trans_id: u8,
        id: u32,
        data: &[u8],
        dlc: u8,
        flags: u32,
    ) -> Self {
        let extended = flags & CAN_MSG_EXT != 0;
        let cmd = if extended {
            CMD_TX_EXT_MESSAGE
        } else {
            CMD_TX_STD_MESSAGE
        };
        let mut c = Self::new(TX_MESSAGE_LEN, cmd);
        c.bytes[2] = channel;
        c.bytes[3] = trans_id;
        let raw = &mut c.bytes[4..18];
        if extended {
            raw[0] = ((id >> 24) & 0x1F) as u8;
            raw[1] = ((id >> 18) & 0x3F) as u8;
            raw[2] = ((id >> 14) & 0x0F) as u8;
            raw[3] = ((id >> 6) & 0xFF) as u8;
            raw[4] = (id & 0x3F) as u8;
        } else {
            raw[0] = ((id >> 6) & 0x1F) as u8;
            raw[1] = (id & 0x3F) as u8;
        }
        raw[5] = dlc & 0x0F;
        let n = data.len().min(CAN_MAX_DLEN);
        raw[6..6 + n].copy_from_slice(&data[..n]);
        if flags & CAN_MSG_RTR != 0 {
            c.bytes[19] |= MSG_FLAG_REMOTE_FRAME;
        }
        c
    }
}

impl WireRecord for LeafCommand {
    const MAX_LEN: usize = CMD_MAX_LEN;
    const TERMINATOR: &'static [u8] = &[0];

    fn encoded_len(&self) -> usize {
        self.bytes[0] as usize
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl std::fmt::Debug for LeafCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LeafCommand({} {:02x?})", self.cmd_no(), self.as_bytes())
    }
}

/// A decoded inbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafEvent {
    Message(CanMsg),
    ChipState {
        channel: u8,
        tx_errors: u8,
        rx_errors: u8,
        bus_status: u8,
    },
    StartChip { trans_id: u8 },
    StopChip { trans_id: u8 },
    CardInfo { serial: u32 },
    SoftwareInfo { firmware_version: u32, max_outstanding_tx: u16 },
    TxAck { trans_id: u8 },
    Other(u8),
}

/// Leaf message flags to `canMSG_*` flags
pub fn leaf_flags_to_canlib(flags: u8) -> u32 {
    let mut out = 0;
    if flags & MSG_FLAG_OVERRUN != 0 {
        out |= CAN_MSGERR_HW_OVERRUN | CAN_MSGERR_SW_OVERRUN;
    }
    if flags & MSG_FLAG_REMOTE_FRAME != 0 {
        out |= CAN_MSG_RTR;
    }
    if flags & MSG_FLAG_ERROR_FRAME != 0 {
        out |= CAN_MSG_ERROR_FRAME;
    }
    if flags & MSG_FLAG_TXACK != 0 {
        out |= CAN_MSG_TXACK;
    }
    if flags & MSG_FLAG_TXRQ != 0 {
        out |= CAN_MSG_TXRQ;
    }
    if flags & MSG_FLAG_NERR != 0 {
        out |= CAN_MSG_NERR;
    }
    if flags & MSG_FLAG_WAKEUP != 0 {
        out |= CAN_MSG_WAKEUP;
    }
    out
}

/// Hardware time in 10 microsecond units
///
/// The 48-bit tick counter runs at 24 MHz; the quotient is truncated to 32
/// bits before scaling.
pub fn timestamp(frame: &[u8], offset: usize) -> u64 {
    let ticks = ticks48([
        le_u16(frame, offset),
        le_u16(frame, offset + 2),
        le_u16(frame, offset + 4),
    ]);
    let units = (ticks / (10 * TIMESTAMP_MHZ)) as u32;
    units as u64 * 10
}

fn unpack_raw_id(raw: &[u8], extended: bool) -> u32 {
    if extended {
        ((raw[0] as u32 & 0x1F) << 24)
            | ((raw[1] as u32 & 0x3F) << 18)
            | ((raw[2] as u32 & 0x0F) << 14)
            | ((raw[3] as u32) << 6)
            | (raw[4] as u32 & 0x3F)
    } else {
        ((raw[0] as u32 & 0x1F) << 6) | (raw[1] as u32 & 0x3F)
    }
}

fn message(id: u32, flags: u32, dlc: u8, data: &[u8], timestamp: u64) -> CanMsg {
    let len = (dlc as usize).min(CAN_MAX_DLEN).min(data.len());
    let mut msg = CanMsg::new(id, &data[..len], flags);
    msg.timestamp = timestamp;
    msg
}

/// Decode one inbound command; `None` if it is shorter than its layout
pub fn decode(frame: &[u8]) -> Option<LeafEvent> {
    if frame.len() < 2 {
        return None;
    }
    let cmd = frame[1];
    let needs = |n: usize| if frame.len() >= n { Some(()) } else { None };
    let event = match cmd {
        CMD_LOG_MESSAGE => {
            needs(24)?;
            let ident = le_u32(frame, 12);
            let (id, mut flags) = if ident & EXT_MSG != 0 {
                (ident & !EXT_MSG, CAN_MSG_EXT)
            } else {
                (ident, CAN_MSG_STD)
            };
            flags |= leaf_flags_to_canlib(frame[3]);
            LeafEvent::Message(message(id, flags, frame[10], &frame[16..24], timestamp(frame, 4)))
        }
        CMD_RX_STD_MESSAGE | CMD_RX_EXT_MESSAGE => {
            needs(24)?;
            let extended = cmd == CMD_RX_EXT_MESSAGE;
            let raw = &frame[10..24];
            let id = unpack_raw_id(raw, extended);
            let flags = if extended { CAN_MSG_EXT } else { CAN_MSG_STD }
                | leaf_flags_to_canlib(frame[3]);
            LeafEvent::Message(message(id, flags, raw[5] & 0x0F, &raw[6..14], timestamp(frame, 4)))
        }
        CMD_CHIP_STATE_EVENT => {
            needs(13)?;
            LeafEvent::ChipState {
                channel: frame[3],
                tx_errors: frame[10],
                rx_errors: frame[11],
                bus_status: frame[12],
            }
        }
        CMD_START_CHIP_RESP => {
            needs(3)?;
            LeafEvent::StartChip { trans_id: frame[2] }
        }
        CMD_STOP_CHIP_RESP => {
            needs(3)?;
            LeafEvent::StopChip { trans_id: frame[2] }
        }
        CMD_GET_CARD_INFO_RESP => {
            needs(8)?;
            LeafEvent::CardInfo {
                serial: le_u32(frame, 4),
            }
        }
        CMD_GET_SOFTWARE_INFO_RESP => {
            needs(14)?;
            LeafEvent::SoftwareInfo {
                firmware_version: le_u32(frame, 8),
                max_outstanding_tx: le_u16(frame, 12),
            }
        }
        CMD_TX_ACKNOWLEDGE => {
            needs(4)?;
            LeafEvent::TxAck { trans_id: frame[3] }
        }
        other => LeafEvent::Other(other),
    };
    Some(event)
}

/// Split a bulk-in buffer into commands
///
/// A zero length byte means the rest of the current 512 byte block is
/// padding. At most 512 commands are taken from one buffer.
pub fn split_frames(buf: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut pos = 0;
    for _ in 0..MAX_FRAMES_PER_READ {
        if pos >= buf.len() {
            break;
        }
        let len = buf[pos] as usize;
        if len == 0 {
            pos = (pos + RX_ALIGN) & !(RX_ALIGN - 1);
            continue;
        }
        if pos + len > buf.len() {
            warn!("truncated Leaf command at offset {pos}");
            break;
        }
        frames.push(&buf[pos..pos + len]);
        pos += len;
    }
    frames
}

/// Resolve a symbolic bitrate and check the resulting prescaler
pub fn resolve_bus_params(params: BusParams) -> Result<BusParams> {
    let timing = lookup_timing(&TIMINGS, params.freq)?;
    let quanta = timing.quanta() as i64;
    let prescaler = CLOCK_HZ / (timing.freq * quanta);
    if !(2..=256).contains(&prescaler) {
        return Err(CanError::Param("prescaler out of range"));
    }
    Ok(timing)
}

// ============================================================================
// Backend
// ============================================================================

/// Kvaser Leaf backend state
pub struct LeafBackend {
    capacity: usize,
    commands: OnceLock<TransmitPipeline<LeafCommand>>,
}

impl LeafBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            capacity: config.command_buffer_capacity,
            commands: OnceLock::new(),
        }
    }

    fn pipeline(&self) -> Result<&TransmitPipeline<LeafCommand>> {
        self.commands.get().ok_or(CanError::NotInitialized)
    }

    /// Write a command now if the pipe is idle, otherwise queue it
    fn send_command(&self, dev: &Device, cmd: LeafCommand) -> Result<()> {
        trace!("{}: command {:?}", dev.handle(), cmd);
        if dev.try_write_command(cmd.as_bytes())? {
            return Ok(());
        }
        let pipeline = self.pipeline()?;
        pipeline.enqueue(cmd)?;
        dev.drain(pipeline)?;
        Ok(())
    }

    fn chip_round_trip(&self, dev: &Device, req: u8, resp: u8) -> Result<()> {
        let trans_id = dev.correlator().next_trans_id(0xFF) as u8;
        let channel = dev.id().channel;
        dev.round_trip(ResponseKey::with_trans_id(resp, trans_id as u16), || {
            self.send_command(dev, LeafCommand::chip(req, trans_id, channel))
        })?;
        Ok(())
    }

    fn handle_event(&self, dev: &Device, frame: &[u8], event: LeafEvent) {
        match event {
            LeafEvent::Message(msg) => dev.push_event(msg),
            LeafEvent::ChipState {
                tx_errors,
                rx_errors,
                bus_status,
                ..
            } => {
                let status = decode_bus_status(bus_status);
                if status.is_none() {
                    warn!("{}: unknown bus status 0x{bus_status:02x}", dev.handle());
                }
                dev.apply_chip_state(status, tx_errors, rx_errors);
            }
            LeafEvent::StartChip { trans_id } => {
                dev.correlator()
                    .complete(CMD_START_CHIP_RESP, Some(trans_id as u16), frame);
            }
            LeafEvent::StopChip { trans_id } => {
                dev.correlator()
                    .complete(CMD_STOP_CHIP_RESP, Some(trans_id as u16), frame);
            }
            LeafEvent::CardInfo { serial } => {
                debug!("{}: serial number {serial}", dev.handle());
                dev.update_info(|info| info.serial_number = serial as u64);
            }
            LeafEvent::SoftwareInfo {
                firmware_version,
                max_outstanding_tx,
            } => {
                debug!(
                    "{}: firmware 0x{firmware_version:08x}, {max_outstanding_tx} outstanding tx",
                    dev.handle()
                );
                dev.update_info(|info| info.firmware_version = firmware_version);
            }
            LeafEvent::TxAck { trans_id } => trace!("{}: tx ack {trans_id}", dev.handle()),
            LeafEvent::Other(cmd) => trace!("{}: command {cmd} ignored", dev.handle()),
        }
    }
}

impl Backend for LeafBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ClassicLeaf
    }

    fn init_hardware(&self, dev: &Device) -> Result<()> {
        let max_packet = dev.endpoints().bulk_out.max_packet_size as usize;
        let pipeline = TransmitPipeline::new(self.capacity, max_packet, true)?;
        if self.commands.set(pipeline).is_err() {
            return Err(CanError::Internal("Leaf already initialised".into()));
        }

        let id = dev.id();
        dev.update_info(|info| {
            info.description = product_name(id.vendor_id, id.product_id).to_string();
            info.capabilities = CAN_CHANNEL_CAP_EXTENDED_CAN;
        });
        dev.arm_read()?;

        let trans_id = dev.correlator().next_trans_id(0xFF) as u8;
        self.send_command(dev, LeafCommand::get_card_info(trans_id))?;
        let trans_id = dev.correlator().next_trans_id(0xFF) as u8;
        self.send_command(dev, LeafCommand::get_software_info(trans_id))?;
        self.set_bus_params(dev, BusParams::new(CAN_BITRATE_125K, 0, 0, 0))
    }

    fn set_bus_params(&self, dev: &Device, params: BusParams) -> Result<()> {
        let timing = resolve_bus_params(params)?;
        let trans_id = dev.correlator().next_trans_id(0xFF) as u8;
        self.send_command(
            dev,
            LeafCommand::set_bus_params(trans_id, dev.id().channel, &timing),
        )?;
        dev.update_timing(|t| t.nominal = Some(timing));
        debug!("{}: bus params {}", dev.handle(), timing);
        Ok(())
    }

    fn bus_on(&self, dev: &Device) -> Result<()> {
        self.chip_round_trip(dev, CMD_START_CHIP_REQ, CMD_START_CHIP_RESP)
    }

    fn bus_off(&self, dev: &Device) -> Result<()> {
        self.chip_round_trip(dev, CMD_STOP_CHIP_REQ, CMD_STOP_CHIP_RESP)
    }

    fn write(
        &self,
        dev: &Device,
        id: u32,
        payload: &[u8],
        dlc: usize,
        flags: u32,
    ) -> Result<()> {
        if flags & CANFD_MSG_FDF != 0 {
            return Err(CanError::Param("CAN FD frame on a classic channel"));
        }
        let len = payload_len(dlc, flags)?;
        let data = copy_payload(payload, len);
        let cmd = LeafCommand::tx_message(dev.id().channel, 0, id, &data[..len], len as u8, flags);
        let pipeline = self.pipeline()?;
        pipeline.enqueue(cmd)?;
        dev.drain(pipeline)?;
        Ok(())
    }

    fn close(&self, dev: &Device) -> Result<()> {
        if let Some(pipeline) = self.commands.get() {
            pipeline.clear();
        }
        dev.clear_events();
        Ok(())
    }

    fn process_read(&self, dev: &Device, buf: &[u8]) {
        for frame in split_frames(buf) {
            match decode(frame) {
                Some(event) => self.handle_event(dev, frame, event),
                None => warn!(
                    "{}: short Leaf command ({} bytes)",
                    dev.handle(),
                    frame.len()
                ),
            }
        }
    }

    fn drain(&self, dev: &Device) -> Result<()> {
        if let Some(pipeline) = self.commands.get() {
            dev.drain(pipeline)?;
        }
        Ok(())
    }
}
