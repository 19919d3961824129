//! PEAK PCAN-USB FD
//!
//! Commands are 8 byte records collected into one synchronous write on the
//! command pipe. CAN traffic uses 4-byte aligned records on the message
//! pipes.

use std::sync::OnceLock;

use log::{debug, trace, warn};

use crate::backend::{lookup_timing, product_name, Backend, BackendKind};
use crate::config::Config;
use crate::constants::*;
use crate::device::Device;
use crate::error::{CanError, Result};
use crate::message::{copy_payload, decode_fd_dlc, encode_fd_dlc, le_u16, le_u32, payload_len, CanMsg};
use crate::pipeline::{TransmitPipeline, WireRecord};
use crate::structures::{
    BusParams, BusParamsFd, BusStatus, Direction, EndpointDescriptor, Endpoints,
};

// Driver-loaded function request
const REQ_TYPE_VENDOR_OTHER: u8 = 0x43;
const REQ_FCT: u8 = 2;
const FCT_DRVLD: u16 = 5;
const FCT_DRVLD_LEN: usize = 16;

pub const CMD_RESET_MODE: u16 = 0x001;
pub const CMD_NORMAL_MODE: u16 = 0x002;
pub const CMD_TIMING_SLOW: u16 = 0x004;
pub const CMD_TIMING_FAST: u16 = 0x005;
pub const CMD_WR_ERR_CNT: u16 = 0x00A;
pub const CMD_SET_EN_OPTION: u16 = 0x00B;
pub const CMD_CLR_DIS_OPTION: u16 = 0x00C;
pub const CMD_END_OF_COLLECTION: u16 = 0x3FF;

pub const WRERRCNT_TE: u16 = 0x4000;
pub const WRERRCNT_RE: u16 = 0x8000;
pub const OPTION_ERROR: u16 = 0x0001;
pub const OPTION_CANFD_ISO: u16 = 0x0004;

/// Default error warning limit
const EWL: u8 = 96;
const CMD_LEN: usize = 8;

// Record types
pub const MSG_CAN_RX: u16 = 0x0001;
pub const MSG_ERROR: u16 = 0x0002;
pub const MSG_STATUS: u16 = 0x0003;
pub const MSG_CAN_TX: u16 = 0x1000;

pub const MSG_FLAG_RTR: u16 = 0x01;
pub const MSG_FLAG_EXT_ID: u16 = 0x02;
pub const MSG_FLAG_LOOPED_BACK: u16 = 0x04;
pub const MSG_FLAG_SINGLE_SHOT: u16 = 0x08;
pub const MSG_FLAG_EXT_DATA_LEN: u16 = 0x10;
pub const MSG_FLAG_BRS: u16 = 0x20;
pub const MSG_FLAG_ESI: u16 = 0x40;
pub const MSG_FLAG_SELF_RECEIVE: u16 = 0x80;

pub const STATUS_PASSIVE: u8 = 0x20;
pub const STATUS_WARNING: u8 = 0x40;
pub const STATUS_BUSOFF: u8 = 0x80;

const MIN_RECORD_LEN: usize = 8;
const RX_HEADER_LEN: usize = 28;
const TX_HEADER_LEN: usize = 20;
pub const TX_MAX_LEN: usize = TX_HEADER_LEN + CANFD_MAX_DLEN;
const ERROR_RECORD_LEN: usize = 16;
const STATUS_RECORD_LEN: usize = 16;

/// brp, tseg1, tseg2, sjw at 80 MHz
const NOMINAL_TIMINGS: [(i64, BusParams); 9] = [
    (CAN_BITRATE_1M, BusParams::new(1, 63, 16, 16)),
    (CAN_BITRATE_500K, BusParams::new(2, 63, 16, 16)),
    (CAN_BITRATE_250K, BusParams::new(4, 63, 16, 16)),
    (CAN_BITRATE_125K, BusParams::new(8, 63, 16, 16)),
    (CAN_BITRATE_100K, BusParams::new(10, 63, 16, 16)),
    (CAN_BITRATE_83K, BusParams::new(12, 63, 16, 16)),
    (CAN_BITRATE_62K, BusParams::new(16, 63, 16, 16)),
    (CAN_BITRATE_50K, BusParams::new(20, 63, 16, 16)),
    (CAN_BITRATE_10K, BusParams::new(100, 63, 16, 16)),
];

const DATA_TIMINGS: [(i64, BusParamsFd); 5] = [
    (CANFD_BITRATE_8M_60P, BusParamsFd::new(1, 5, 4, 4)),
    (CANFD_BITRATE_4M_80P, BusParamsFd::new(1, 15, 4, 4)),
    (CANFD_BITRATE_2M_80P, BusParamsFd::new(2, 15, 4, 4)),
    (CANFD_BITRATE_1M_80P, BusParamsFd::new(4, 15, 4, 4)),
    (CANFD_BITRATE_500K_80P, BusParamsFd::new(8, 15, 4, 4)),
];

fn register(value: u32) -> u8 {
    value.saturating_sub(1) as u8
}

/// One 8 byte command
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeakCommand {
    bytes: [u8; CMD_LEN],
}

impl PeakCommand {
    fn new(opcode: u16, channel: u8) -> Self {
        let mut bytes = [0u8; CMD_LEN];
        let opcode_channel = ((channel as u16 & 0x0F) << 12) | (opcode & 0x3FF);
        bytes[0..2].copy_from_slice(&opcode_channel.to_le_bytes());
        Self { bytes }
    }

    pub fn reset_mode(channel: u8) -> Self {
        Self::new(CMD_RESET_MODE, channel)
    }

    pub fn normal_mode(channel: u8) -> Self {
        Self::new(CMD_NORMAL_MODE, channel)
    }

    pub fn end_of_collection() -> Self {
        Self::new(CMD_END_OF_COLLECTION, 0)
    }

    pub fn timing_slow(channel: u8, timing: &BusParams) -> Self {
        let mut cmd = Self::new(CMD_TIMING_SLOW, channel);
        let triple = if timing.no_samp == 3 { 0x80 } else { 0 };
        cmd.bytes[2] = EWL;
        cmd.bytes[3] = (register(timing.sjw) & 0x7F) | triple;
        cmd.bytes[4] = register(timing.tseg2);
        cmd.bytes[5] = register(timing.tseg1);
        let brp = (timing.freq as u16).saturating_sub(1);
        cmd.bytes[6..8].copy_from_slice(&brp.to_le_bytes());
        cmd
    }

    pub fn timing_fast(channel: u8, timing: &BusParamsFd) -> Self {
        let mut cmd = Self::new(CMD_TIMING_FAST, channel);
        cmd.bytes[3] = register(timing.sjw);
        cmd.bytes[4] = register(timing.tseg2);
        cmd.bytes[5] = register(timing.tseg1);
        let brp = (timing.freq as u16).saturating_sub(1);
        cmd.bytes[6..8].copy_from_slice(&brp.to_le_bytes());
        cmd
    }

    /// Reset the selected error counters to zero
    pub fn clear_error_counters(channel: u8) -> Self {
        let mut cmd = Self::new(CMD_WR_ERR_CNT, channel);
        cmd.bytes[2..4].copy_from_slice(&(WRERRCNT_TE | WRERRCNT_RE).to_le_bytes());
        cmd
    }

    pub fn options(channel: u8, enable: bool, options: u16) -> Self {
        let opcode = if enable {
            CMD_SET_EN_OPTION
        } else {
            CMD_CLR_DIS_OPTION
        };
        let mut cmd = Self::new(opcode, channel);
        cmd.bytes[4..6].copy_from_slice(&options.to_le_bytes());
        cmd
    }

    pub fn opcode(&self) -> u16 {
        le_u16(&self.bytes, 0) & 0x3FF
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for PeakCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeakCommand(0x{:03x}, {:02x?})", self.opcode(), &self.bytes[2..])
    }
}

/// Concatenate commands and close the collection
pub fn collect(commands: &[PeakCommand]) -> Vec<u8> {
    let mut out = Vec::with_capacity((commands.len() + 1) * CMD_LEN);
    for cmd in commands.iter().chain(std::iter::once(&PeakCommand::end_of_collection())) {
        out.extend_from_slice(cmd.as_bytes());
    }
    out
}

/// An outbound CAN message record
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeakMessage {
    bytes: [u8; TX_MAX_LEN],
    len: usize,
}

impl PeakMessage {
    /// `len` is the frame length in bytes; `data` holds the payload to send
    pub fn new(channel: u8, id: u32, data: &[u8], len: usize, flags: u32) -> Result<Self> {
        let code = encode_fd_dlc(len);
        if code == INVALID_DLC || data.len() > CANFD_MAX_DLEN {
            return Err(CanError::Param("dlc has no CAN FD length code"));
        }
        let mut msg_flags = 0u16;
        if flags & CAN_MSG_RTR != 0 {
            msg_flags |= MSG_FLAG_RTR;
        }
        if flags & CAN_MSG_EXT != 0 {
            msg_flags |= MSG_FLAG_EXT_ID;
        }
        if flags & CANFD_MSG_FDF != 0 {
            msg_flags |= MSG_FLAG_EXT_DATA_LEN;
            if flags & CANFD_MSG_BRS != 0 {
                msg_flags |= MSG_FLAG_BRS;
            }
        }
        let size = (TX_HEADER_LEN + data.len() + 3) & !3;
        let mut bytes = [0u8; TX_MAX_LEN];
        bytes[0..2].copy_from_slice(&(size as u16).to_le_bytes());
        bytes[2..4].copy_from_slice(&MSG_CAN_TX.to_le_bytes());
        bytes[12] = (channel & 0x0F) | (code << 4);
        bytes[14..16].copy_from_slice(&msg_flags.to_le_bytes());
        bytes[16..20].copy_from_slice(&id.to_le_bytes());
        bytes[TX_HEADER_LEN..TX_HEADER_LEN + data.len()].copy_from_slice(data);
        Ok(Self { bytes, len: size })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl WireRecord for PeakMessage {
    const MAX_LEN: usize = TX_MAX_LEN;
    const TERMINATOR: &'static [u8] = &[0, 0, 0, 0];

    fn encoded_len(&self) -> usize {
        self.len
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl std::fmt::Debug for PeakMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeakMessage({:02x?})", self.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeakEvent {
    Message { channel: u8, msg: CanMsg },
    Error { channel: u8, tx_errors: u8, rx_errors: u8, timestamp: u64 },
    Status { channel: u8, status: BusStatus },
    Other(u16),
}

/// Split a bulk-in buffer into records; a zero size ends the buffer
///
/// No more records are taken than the smallest record fits in the buffer.
pub fn split_records(buf: &[u8]) -> Vec<&[u8]> {
    let max_records = buf.len() / MIN_RECORD_LEN;
    let mut records = Vec::new();
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        let size = le_u16(buf, pos) as usize;
        if size == 0 {
            break;
        }
        if records.len() == max_records {
            warn!("more than {max_records} PEAK records in {} bytes", buf.len());
            break;
        }
        let end = pos + size;
        if end > buf.len() {
            warn!("truncated PEAK record at offset {pos}");
            break;
        }
        records.push(&buf[pos..end]);
        pos = (end + 3) & !3;
    }
    records
}

fn record_timestamp(record: &[u8]) -> u64 {
    (le_u32(record, 8) as u64) << 32 | le_u32(record, 4) as u64
}

/// Decode one record
pub fn decode_record(record: &[u8]) -> Option<PeakEvent> {
    if record.len() < 4 {
        return None;
    }
    let event = match le_u16(record, 2) {
        MSG_CAN_RX => {
            if record.len() < RX_HEADER_LEN {
                return None;
            }
            let channel = record[20] & 0x0F;
            let msg_flags = le_u16(record, 22);
            let mut len = decode_fd_dlc(record[20] >> 4);
            let mut flags = if msg_flags & MSG_FLAG_EXT_ID != 0 {
                CAN_MSG_EXT
            } else {
                CAN_MSG_STD
            };
            if msg_flags & MSG_FLAG_EXT_DATA_LEN != 0 {
                flags |= CANFD_MSG_FDF;
            } else {
                len = len.min(CAN_MAX_DLEN);
            }
            if msg_flags & MSG_FLAG_BRS != 0 {
                flags |= CANFD_MSG_BRS;
            }
            if msg_flags & MSG_FLAG_ESI != 0 {
                flags |= CANFD_MSG_ESI;
            }
            if msg_flags & MSG_FLAG_LOOPED_BACK != 0 {
                flags |= CAN_MSG_TXACK;
            }
            let data = &record[RX_HEADER_LEN..];
            let mut msg = if msg_flags & MSG_FLAG_RTR != 0 {
                let mut msg = CanMsg::new(le_u32(record, 24), &[], flags | CAN_MSG_RTR);
                msg.dlc = len as u8;
                msg
            } else {
                CanMsg::new(le_u32(record, 24), &data[..len.min(data.len())], flags)
            };
            msg.timestamp = record_timestamp(record);
            PeakEvent::Message { channel, msg }
        }
        MSG_ERROR => {
            if record.len() < ERROR_RECORD_LEN {
                return None;
            }
            PeakEvent::Error {
                channel: record[12] & 0x0F,
                tx_errors: record[14],
                rx_errors: record[15],
                timestamp: record_timestamp(record),
            }
        }
        MSG_STATUS => {
            if record.len() < STATUS_RECORD_LEN {
                return None;
            }
            let bits = record[12];
            let status = if bits & STATUS_BUSOFF != 0 {
                BusStatus::BusOff
            } else if bits & STATUS_PASSIVE != 0 {
                BusStatus::ErrorPassive
            } else {
                BusStatus::ErrorActive
            };
            PeakEvent::Status {
                channel: bits & 0x0F,
                status,
            }
        }
        other => PeakEvent::Other(other),
    };
    Some(event)
}

/// PEAK PCAN-USB FD backend state
pub struct PeakBackend {
    capacity: usize,
    tx: OnceLock<TransmitPipeline<PeakMessage>>,
}

impl PeakBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            capacity: config.command_buffer_capacity,
            tx: OnceLock::new(),
        }
    }

    fn pipeline(&self) -> Result<&TransmitPipeline<PeakMessage>> {
        self.tx.get().ok_or(CanError::NotInitialized)
    }

    fn driver_loaded(&self, dev: &Device, loaded: bool) -> Result<()> {
        let mut data = [0u8; FCT_DRVLD_LEN];
        data[1] = loaded as u8;
        dev.control_out(REQ_TYPE_VENDOR_OTHER, REQ_FCT, FCT_DRVLD, 0, &data)?;
        Ok(())
    }

    fn send_commands(&self, dev: &Device, commands: &[PeakCommand]) -> Result<()> {
        trace!("{}: commands {:?}", dev.handle(), commands);
        dev.write_sync(dev.endpoints().command_out.address, &collect(commands))
    }
}

impl Backend for PeakBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PeakFd
    }

    /// Commands go to the first bulk out endpoint, CAN records to the last
    fn select_endpoints(&self, discovered: &[EndpointDescriptor], _channel: u8) -> Result<Endpoints> {
        let mut endpoints = Endpoints::from_descriptors(discovered).ok_or(CanError::NotFound)?;
        if let Some(command) = discovered.iter().find(|ep| ep.direction == Direction::Out) {
            endpoints.command_out = *command;
        }
        Ok(endpoints)
    }

    fn init_hardware(&self, dev: &Device) -> Result<()> {
        let max_packet = dev.endpoints().bulk_out.max_packet_size as usize;
        let pipeline = TransmitPipeline::new(self.capacity, max_packet, false)?;
        if self.tx.set(pipeline).is_err() {
            return Err(CanError::Internal("PEAK already initialised".into()));
        }

        self.driver_loaded(dev, true)?;
        let id = dev.id();
        dev.update_info(|info| {
            info.description = product_name(id.vendor_id, id.product_id).to_string();
            info.capabilities = CAN_CHANNEL_CAP_EXTENDED_CAN | CAN_CHANNEL_CAP_CAN_FD;
        });
        dev.arm_read()
    }

    fn set_bus_params(&self, dev: &Device, params: BusParams) -> Result<()> {
        let mut timing = lookup_timing(&NOMINAL_TIMINGS, params.freq)?;
        timing.no_samp = params.no_samp;
        let channel = dev.id().channel;
        self.send_commands(
            dev,
            &[
                PeakCommand::reset_mode(channel),
                PeakCommand::timing_slow(channel, &timing),
            ],
        )?;
        dev.update_timing(|t| t.nominal = Some(timing));
        debug!("{}: bus params {}", dev.handle(), timing);
        Ok(())
    }

    fn set_bus_params_fd(&self, dev: &Device, params: BusParamsFd) -> Result<()> {
        if !dev.is_fd() {
            return Err(CanError::Param("channel not opened in CAN FD mode"));
        }
        let timing = lookup_timing(&DATA_TIMINGS, params.freq)?;
        let channel = dev.id().channel;
        self.send_commands(
            dev,
            &[
                PeakCommand::reset_mode(channel),
                PeakCommand::timing_fast(channel, &timing),
            ],
        )?;
        dev.update_timing(|t| t.data = Some(timing));
        Ok(())
    }

    fn bus_on(&self, dev: &Device) -> Result<()> {
        let channel = dev.id().channel;
        let mut commands = vec![PeakCommand::clear_error_counters(channel)];
        if dev.is_fd() {
            commands.push(PeakCommand::options(channel, true, OPTION_ERROR | OPTION_CANFD_ISO));
        } else {
            commands.push(PeakCommand::options(channel, true, OPTION_ERROR));
            commands.push(PeakCommand::options(channel, false, OPTION_CANFD_ISO));
        }
        commands.push(PeakCommand::normal_mode(channel));
        self.send_commands(dev, &commands)
    }

    fn bus_off(&self, dev: &Device) -> Result<()> {
        self.send_commands(dev, &[PeakCommand::reset_mode(dev.id().channel)])
    }

    fn write(
        &self,
        dev: &Device,
        id: u32,
        payload: &[u8],
        dlc: usize,
        flags: u32,
    ) -> Result<()> {
        if flags & CANFD_MSG_FDF != 0 && !dev.is_fd() {
            return Err(CanError::Param("CAN FD frame on a classic channel"));
        }
        let len = payload_len(dlc, flags)?;
        let data = copy_payload(payload, len);
        let sent = if flags & CAN_MSG_RTR != 0 { 0 } else { len };
        let record = PeakMessage::new(dev.id().channel, id, &data[..sent], len, flags)?;
        let pipeline = self.pipeline()?;
        pipeline.enqueue(record)?;
        dev.drain(pipeline)?;
        Ok(())
    }

    fn close(&self, dev: &Device) -> Result<()> {
        if let Some(pipeline) = self.tx.get() {
            pipeline.clear();
        }
        dev.clear_events();
        if let Err(e) = self.driver_loaded(dev, false) {
            warn!("{}: driver unload notification failed: {e}", dev.handle());
        }
        Ok(())
    }

    fn process_read(&self, dev: &Device, buf: &[u8]) {
        let own = dev.id().channel;
        for record in split_records(buf) {
            match decode_record(record) {
                Some(PeakEvent::Message { channel, msg }) if channel == own => dev.push_event(msg),
                Some(PeakEvent::Error {
                    channel,
                    tx_errors,
                    rx_errors,
                    timestamp,
                }) if channel == own => {
                    let mut msg = CanMsg::new(0, &[], CAN_MSG_ERROR_FRAME);
                    msg.timestamp = timestamp;
                    dev.push_event(msg);
                    dev.apply_chip_state(None, tx_errors, rx_errors);
                }
                Some(PeakEvent::Status { channel, status }) if channel == own => {
                    let chip = dev.chip_state();
                    dev.apply_chip_state(Some(status), chip.tx_errors, chip.rx_errors);
                }
                Some(PeakEvent::Other(kind)) => {
                    trace!("{}: record type 0x{kind:04x} ignored", dev.handle())
                }
                Some(event) => trace!("{}: record for another channel: {event:?}", dev.handle()),
                None => warn!("{}: short PEAK record", dev.handle()),
            }
        }
    }

    fn drain(&self, dev: &Device) -> Result<()> {
        if let Some(pipeline) = self.tx.get() {
            dev.drain(pipeline)?;
        }
        Ok(())
    }
}
