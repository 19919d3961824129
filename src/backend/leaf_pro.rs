//! Kvaser Leaf Pro (hydra protocol)
//!
//! Standard commands are fixed 32 byte records addressed to a hydra end
//! point ("he address") learned through channel mapping. Firmware with the
//! extended capability also accepts variable length extended commands,
//! which carry CAN FD frames.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

use log::{debug, trace, warn};

use crate::backend::leaf::{leaf_flags_to_canlib, timestamp};
use crate::backend::{lookup_timing, product_name, Backend, BackendKind};
use crate::config::Config;
use crate::constants::*;
use crate::correlator::ResponseKey;
use crate::device::Device;
use crate::error::{CanError, Result};
use crate::message::{
    copy_payload, decode_fd_dlc, encode_fd_dlc, le_u16, le_u32, le_u64, payload_len, CanMsg,
};
use crate::pipeline::{TransmitPipeline, WireRecord};
use crate::structures::{decode_bus_status, BusParams, BusParamsFd};

pub const CMD_SET_BUSPARAMS_REQ: u8 = 16;
pub const CMD_CHIP_STATE_EVENT: u8 = 20;
pub const CMD_START_CHIP_REQ: u8 = 26;
pub const CMD_START_CHIP_RESP: u8 = 27;
pub const CMD_STOP_CHIP_REQ: u8 = 28;
pub const CMD_STOP_CHIP_RESP: u8 = 29;
pub const CMD_TX_CAN_MESSAGE: u8 = 33;
pub const CMD_SET_BUSPARAMS_FD_REQ: u8 = 69;
pub const CMD_SET_BUSPARAMS_RESP: u8 = 85;
pub const CMD_LOG_MESSAGE: u8 = 106;
pub const CMD_MAP_CHANNEL_REQ: u8 = 200;
pub const CMD_MAP_CHANNEL_RESP: u8 = 201;
pub const CMD_GET_SOFTWARE_DETAILS_REQ: u8 = 202;
pub const CMD_GET_SOFTWARE_DETAILS_RESP: u8 = 203;
pub const CMD_EXTENDED: u8 = 255;

pub const CMD_EXT_TX_CAN_MESSAGE_FD: u8 = 224;
pub const CMD_EXT_RX_MESSAGE_FD: u8 = 226;

pub const SW_FLAG_CANFD: u32 = 0x400;
pub const SW_FLAG_EXT_CAP: u32 = 0x1000;

pub const MSG_FLAG_ERROR_FRAME: u32 = 0x01;
pub const MSG_FLAG_OVERRUN: u32 = 0x02;
pub const MSG_FLAG_REMOTE_FRAME: u32 = 0x10;
pub const MSG_FLAG_EXTENDED: u32 = 0x20;
pub const MSG_FLAG_TX_ACK: u32 = 0x40;
pub const MSG_FLAG_FDF: u32 = 0x1_0000;
pub const MSG_FLAG_BRS: u32 = 0x2_0000;
pub const MSG_FLAG_ESI: u32 = 0x4_0000;

// kcan header bits of an extended transmit
pub const KCAN_HEADER_BRS: u32 = 1 << 14;
pub const KCAN_HEADER_FDF: u32 = 1 << 15;
pub const KCAN_HEADER_RTR: u32 = 1 << 29;
pub const KCAN_HEADER_IDE: u32 = 1 << 30;
pub const KCAN_HEADER_AREQ: u32 = 1 << 31;

/// Extended log ident marker
pub const EXT_MSG: u32 = 0x8000_0000;

pub const STD_CMD_LEN: usize = 32;
const EXT_HEADER_LEN: usize = 8;
const EXT_TX_FD_HEADER_LEN: usize = 20;
/// Largest extended command: headers plus a 64 byte payload, 8 byte aligned
pub const EXT_CMD_MAX_LEN: usize = 96;

/// Address of the channel router, used before mapping
const ROUTER_ADDRESS: u8 = 0;
const TRANS_ID_MASK: u16 = 0x0FFF;

const CLASSIC_CLOCK_HZ: i64 = 16_000_000;
const FD_CLOCK_HZ: i64 = 80_000_000;

const NOMINAL_TIMINGS: [(i64, BusParams); 8] = [
    (CAN_BITRATE_1M, BusParams::new(1_000_000, 6, 1, 1)),
    (CAN_BITRATE_500K, BusParams::new(500_000, 6, 1, 1)),
    (CAN_BITRATE_250K, BusParams::new(250_000, 6, 1, 1)),
    (CAN_BITRATE_125K, BusParams::new(125_000, 13, 2, 1)),
    (CAN_BITRATE_100K, BusParams::new(100_000, 13, 2, 1)),
    (CAN_BITRATE_83K, BusParams::new(83_333, 5, 2, 2)),
    (CAN_BITRATE_62K, BusParams::new(62_500, 10, 5, 1)),
    (CAN_BITRATE_50K, BusParams::new(50_000, 10, 5, 1)),
];

const DATA_TIMINGS: [(i64, BusParamsFd); 5] = [
    (CANFD_BITRATE_500K_80P, BusParamsFd::new(500_000, 63, 16, 16)),
    (CANFD_BITRATE_1M_80P, BusParamsFd::new(1_000_000, 31, 8, 8)),
    (CANFD_BITRATE_2M_80P, BusParamsFd::new(2_000_000, 15, 4, 4)),
    (CANFD_BITRATE_4M_80P, BusParamsFd::new(4_000_000, 7, 2, 2)),
    (CANFD_BITRATE_8M_60P, BusParamsFd::new(8_000_000, 2, 2, 1)),
];

/// Outbound hydra command, standard or extended
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProCommand {
    bytes: [u8; EXT_CMD_MAX_LEN],
    len: usize,
}

impl ProCommand {
    pub fn standard(cmd: u8, address: u8, trans_id: u16) -> Self {
        let mut bytes = [0u8; EXT_CMD_MAX_LEN];
        bytes[0] = cmd;
        bytes[1] = address;
        bytes[2..4].copy_from_slice(&trans_id.to_le_bytes());
        Self {
            bytes,
            len: STD_CMD_LEN,
        }
    }

    /// Extended command with `body_len` bytes after the 8 byte header
    fn extended(cmd_ext: u8, address: u8, trans_id: u16, body_len: usize) -> Self {
        let len = (EXT_HEADER_LEN + body_len + 7) & !7;
        let mut c = Self::standard(CMD_EXTENDED, address, trans_id);
        c.len = len;
        c.bytes[4..6].copy_from_slice(&(len as u16).to_le_bytes());
        c.bytes[6] = cmd_ext;
        c
    }

    pub fn cmd_no(&self) -> u8 {
        self.bytes[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn map_channel(channel: u8) -> Self {
        let mut c = Self::standard(
            CMD_MAP_CHANNEL_REQ,
            ROUTER_ADDRESS,
            0x40 | channel as u16,
        );
        c.bytes[4..7].copy_from_slice(b"CAN");
        c.bytes[20] = channel;
        c
    }

    pub fn set_bus_params(address: u8, trans_id: u16, channel: u8, params: &BusParams) -> Self {
        let mut c = Self::standard(CMD_SET_BUSPARAMS_REQ, address, trans_id);
        c.put_nominal(params);
        c.bytes[12] = channel;
        c
    }

    pub fn set_bus_params_fd(
        address: u8,
        trans_id: u16,
        nominal: &BusParams,
        data: &BusParamsFd,
    ) -> Self {
        let mut c = Self::standard(CMD_SET_BUSPARAMS_FD_REQ, address, trans_id);
        c.put_nominal(nominal);
        c.put_u32(16, data.freq as u32);
        c.bytes[20] = data.tseg1 as u8;
        c.bytes[21] = data.tseg2 as u8;
        c.bytes[22] = data.sjw as u8;
        c.bytes[23] = 1;
        c
    }

    fn put_nominal(&mut self, params: &BusParams) {
        self.put_u32(4, params.freq as u32);
        self.bytes[8] = params.tseg1 as u8;
        self.bytes[9] = params.tseg2 as u8;
        self.bytes[10] = params.sjw as u8;
        self.bytes[11] = params.no_samp.max(1) as u8;
    }

    /// Classic transmit in the standard format
    pub fn tx_message(
        address: u8,
        trans_id: u16,
        channel: u8,
        id: u32,
        data: &[u8],
        flags: u32,
    ) -> Self {
        let mut c = Self::standard(CMD_TX_CAN_MESSAGE, address, trans_id);
        let ident = if flags & CAN_MSG_EXT != 0 {
            (id & CAN_EFF_MASK) | EXT_MSG
        } else {
            id & CAN_SFF_MASK
        };
        c.put_u32(4, ident);
        let n = data.len().min(CAN_MAX_DLEN);
        c.bytes[8..8 + n].copy_from_slice(&data[..n]);
        c.bytes[16] = n as u8;
        if flags & CAN_MSG_RTR != 0 {
            c.bytes[17] |= MSG_FLAG_REMOTE_FRAME as u8;
        }
        c.bytes[18..20].copy_from_slice(&trans_id.to_le_bytes());
        c.bytes[20] = channel;
        c
    }

    /// Classic or FD transmit in the extended format
    pub fn tx_message_fd(address: u8, trans_id: u16, id: u32, data: &[u8], flags: u32) -> Self {
        let n = data.len().min(CANFD_MAX_DLEN);
        let mut c = Self::extended(
            CMD_EXT_TX_CAN_MESSAGE_FD,
            address,
            trans_id,
            EXT_TX_FD_HEADER_LEN + n,
        );
        let dlc = encode_fd_dlc(n);
        let mut msg_flags = 0;
        let mut kcan = (dlc as u32 & 0x0F) << 8;
        let ident = if flags & CAN_MSG_EXT != 0 {
            msg_flags |= MSG_FLAG_EXTENDED;
            kcan |= KCAN_HEADER_IDE;
            id & CAN_EFF_MASK
        } else {
            id & CAN_SFF_MASK
        };
        if flags & CAN_MSG_RTR != 0 {
            msg_flags |= MSG_FLAG_REMOTE_FRAME;
            kcan |= KCAN_HEADER_RTR;
        }
        if flags & CANFD_MSG_FDF != 0 {
            msg_flags |= MSG_FLAG_FDF;
            kcan |= KCAN_HEADER_FDF;
            if flags & CANFD_MSG_BRS != 0 {
                msg_flags |= MSG_FLAG_BRS;
                kcan |= KCAN_HEADER_BRS;
            }
        }
        c.put_u32(8, msg_flags);
        c.put_u32(12, ident);
        c.put_u32(16, kcan);
        c.bytes[20] = n as u8;
        c.bytes[21] = dlc;
        c.bytes[28..28 + n].copy_from_slice(&data[..n]);
        c
    }
}

impl WireRecord for ProCommand {
    const MAX_LEN: usize = EXT_CMD_MAX_LEN;
    const TERMINATOR: &'static [u8] = &[0];

    fn encoded_len(&self) -> usize {
        self.len
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl std::fmt::Debug for ProCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProCommand({} {:02x?})", self.cmd_no(), self.as_bytes())
    }
}

/// Leaf Pro log message flags to canlib flags
fn pro_flags_to_canlib(flags: u32) -> u32 {
    let mut out = leaf_flags_to_canlib((flags & 0xDF) as u8);
    if flags & MSG_FLAG_FDF != 0 {
        out |= CANFD_MSG_FDF;
    }
    if flags & MSG_FLAG_BRS != 0 {
        out |= CANFD_MSG_BRS;
    }
    if flags & MSG_FLAG_ESI != 0 {
        out |= CANFD_MSG_ESI;
    }
    out
}

/// A decoded hydra command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProEvent {
    Message(CanMsg),
    ChipState {
        tx_errors: u8,
        rx_errors: u8,
        bus_status: u8,
    },
    MapChannel {
        he_address: u8,
    },
    SoftwareDetails {
        sw_flags: u32,
        sw_version: u32,
    },
    Other(u8),
}

/// Decode a standard 32 byte command
pub fn decode_standard(frame: &[u8]) -> Option<ProEvent> {
    if frame.len() < STD_CMD_LEN {
        return None;
    }
    let event = match frame[0] {
        CMD_LOG_MESSAGE => {
            let ident = le_u32(frame, 16);
            let (id, mut flags) = if ident & EXT_MSG != 0 {
                (ident & !EXT_MSG, CAN_MSG_EXT)
            } else {
                (ident, CAN_MSG_STD)
            };
            flags |= leaf_flags_to_canlib(frame[7] & !(MSG_FLAG_EXTENDED as u8));
            let len = (frame[14] as usize).min(CAN_MAX_DLEN);
            let mut msg = CanMsg::new(id, &frame[20..20 + len], flags);
            msg.timestamp = timestamp(frame, 8);
            ProEvent::Message(msg)
        }
        CMD_CHIP_STATE_EVENT => ProEvent::ChipState {
            tx_errors: frame[10],
            rx_errors: frame[11],
            bus_status: frame[12],
        },
        CMD_MAP_CHANNEL_RESP => ProEvent::MapChannel {
            he_address: frame[4],
        },
        CMD_GET_SOFTWARE_DETAILS_RESP => ProEvent::SoftwareDetails {
            sw_flags: le_u32(frame, 8),
            sw_version: le_u32(frame, 12),
        },
        other => ProEvent::Other(other),
    };
    Some(event)
}

/// Decode an extended command; the sub command is at offset 6
pub fn decode_extended(frame: &[u8]) -> Option<ProEvent> {
    if frame.len() < EXT_HEADER_LEN {
        return None;
    }
    match frame[6] {
        CMD_EXT_RX_MESSAGE_FD => {
            if frame.len() < 28 {
                return None;
            }
            let flags = le_u32(frame, 8);
            let id = le_u32(frame, 12);
            let ticks = le_u64(frame, 16) & 0xFFFF_FFFF_FFFF;
            let code = frame[25];
            let len = if flags & MSG_FLAG_FDF != 0 {
                decode_fd_dlc(code)
            } else {
                (code as usize).min(CAN_MAX_DLEN)
            };
            let len = len.min(frame.len() - 28);
            let mut canlib = pro_flags_to_canlib(flags);
            canlib |= if flags & MSG_FLAG_EXTENDED != 0 {
                CAN_MSG_EXT
            } else {
                CAN_MSG_STD
            };
            let mut msg = CanMsg::new(id, &frame[28..28 + len], canlib);
            msg.timestamp = ((ticks / 240) as u32) as u64 * 10;
            Some(ProEvent::Message(msg))
        }
        other => Some(ProEvent::Other(other)),
    }
}

/// Split a bulk-in buffer into commands
///
/// A zero command byte pads to the next `align` boundary. At most `align`
/// commands are taken from one buffer.
pub fn split_frames(buf: &[u8], align: usize) -> Vec<&[u8]> {
    let align = align.max(STD_CMD_LEN);
    let mut frames = Vec::new();
    let mut pos = 0;
    for _ in 0..align {
        if pos >= buf.len() {
            break;
        }
        let len = match buf[pos] {
            0 => {
                pos = (pos / align + 1) * align;
                continue;
            }
            CMD_EXTENDED => {
                if pos + EXT_HEADER_LEN > buf.len() {
                    break;
                }
                let len = le_u16(buf, pos + 4) as usize;
                if len < EXT_HEADER_LEN {
                    warn!("extended command with length {len}, buffer dropped");
                    break;
                }
                len
            }
            _ => STD_CMD_LEN,
        };
        if pos + len > buf.len() {
            warn!("truncated hydra command at offset {pos}");
            break;
        }
        frames.push(&buf[pos..pos + len]);
        pos += len;
    }
    frames
}

fn check_prescaler(
    clock: i64,
    freq: i64,
    quanta: u32,
    range: std::ops::RangeInclusive<i64>,
) -> Result<()> {
    let divisor = freq * quanta as i64;
    if divisor <= 0 || !range.contains(&(clock / divisor)) {
        return Err(CanError::Param("prescaler out of range"));
    }
    Ok(())
}

/// Kvaser Leaf Pro backend state
pub struct LeafProBackend {
    capacity: usize,
    commands: OnceLock<TransmitPipeline<ProCommand>>,
    he_address: AtomicU8,
    extended: AtomicBool,
}

impl LeafProBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            capacity: config.command_buffer_capacity,
            commands: OnceLock::new(),
            he_address: AtomicU8::new(ROUTER_ADDRESS),
            extended: AtomicBool::new(false),
        }
    }

    pub fn is_extended(&self) -> bool {
        self.extended.load(Ordering::Acquire)
    }

    fn address(&self) -> u8 {
        self.he_address.load(Ordering::Acquire)
    }

    fn pipeline(&self) -> Result<&TransmitPipeline<ProCommand>> {
        self.commands.get().ok_or(CanError::NotInitialized)
    }

    fn send_command(&self, dev: &Device, cmd: ProCommand) -> Result<()> {
        trace!("{}: command {:?}", dev.handle(), cmd);
        if dev.try_write_command(cmd.as_bytes())? {
            return Ok(());
        }
        let pipeline = self.pipeline()?;
        pipeline.enqueue(cmd)?;
        dev.drain(pipeline)?;
        Ok(())
    }

    fn request(&self, dev: &Device, key: ResponseKey, cmd: ProCommand) -> Result<Vec<u8>> {
        dev.round_trip(key, || self.send_command(dev, cmd))
    }

    fn trans_id(dev: &Device) -> u16 {
        dev.correlator().next_trans_id(TRANS_ID_MASK)
    }

    fn map_channel(&self, dev: &Device) -> Result<()> {
        let channel = dev.id().channel;
        let cmd = ProCommand::map_channel(channel);
        let key = ResponseKey::with_trans_id(CMD_MAP_CHANNEL_RESP, 0x40 | channel as u16);
        let resp = self.request(dev, key, cmd)?;
        let Some(ProEvent::MapChannel { he_address }) = decode_standard(&resp) else {
            return Err(CanError::InvalidResponse {
                expected: STD_CMD_LEN,
                actual: resp.len(),
            });
        };
        self.he_address.store(he_address, Ordering::Release);
        debug!("{}: channel {channel} at he address {he_address}", dev.handle());
        Ok(())
    }

    fn query_software_details(&self, dev: &Device) -> Result<()> {
        let trans_id = Self::trans_id(dev);
        let mut cmd = ProCommand::standard(CMD_GET_SOFTWARE_DETAILS_REQ, self.address(), trans_id);
        // Request the extended capability word
        cmd.bytes[4] = 1;
        let key = ResponseKey::with_trans_id(CMD_GET_SOFTWARE_DETAILS_RESP, trans_id);
        let resp = self.request(dev, key, cmd)?;
        let Some(ProEvent::SoftwareDetails {
            sw_flags,
            sw_version,
        }) = decode_standard(&resp)
        else {
            return Err(CanError::InvalidResponse {
                expected: STD_CMD_LEN,
                actual: resp.len(),
            });
        };
        let extended = sw_flags & SW_FLAG_EXT_CAP != 0;
        self.extended.store(extended, Ordering::Release);
        dev.update_info(|info| {
            info.firmware_version = sw_version;
            if sw_flags & SW_FLAG_CANFD != 0 {
                info.capabilities |= CAN_CHANNEL_CAP_CAN_FD;
            }
        });
        debug!(
            "{}: firmware 0x{sw_version:08x}, flags 0x{sw_flags:08x}, {} mode",
            dev.handle(),
            if extended { "extended" } else { "standard" }
        );
        Ok(())
    }

    fn check_nominal(&self, dev: &Device, timing: &BusParams) -> Result<()> {
        if dev.is_fd() {
            check_prescaler(FD_CLOCK_HZ, timing.freq, timing.quanta(), 1..=256)
        } else {
            check_prescaler(CLASSIC_CLOCK_HZ, timing.freq, timing.quanta(), 2..=256)
        }
    }

    fn handle_event(&self, dev: &Device, event: ProEvent) {
        match event {
            ProEvent::Message(msg) => dev.push_event(msg),
            ProEvent::ChipState {
                tx_errors,
                rx_errors,
                bus_status,
            } => {
                let status = decode_bus_status(bus_status);
                if status.is_none() {
                    warn!("{}: unknown bus status 0x{bus_status:02x}", dev.handle());
                }
                dev.apply_chip_state(status, tx_errors, rx_errors);
            }
            ProEvent::MapChannel { he_address } => {
                trace!("{}: map response, he address {he_address}", dev.handle())
            }
            ProEvent::SoftwareDetails { .. } => {}
            ProEvent::Other(cmd) => trace!("{}: command {cmd} ignored", dev.handle()),
        }
    }
}

impl Backend for LeafProBackend {
    fn kind(&self) -> BackendKind {
        if self.is_extended() {
            BackendKind::LeafProExtendedFd
        } else {
            BackendKind::LeafPro
        }
    }

    fn init_hardware(&self, dev: &Device) -> Result<()> {
        let max_packet = dev.endpoints().bulk_out.max_packet_size as usize;
        let pipeline = TransmitPipeline::new(self.capacity, max_packet, true)?;
        if self.commands.set(pipeline).is_err() {
            return Err(CanError::Internal("Leaf Pro already initialised".into()));
        }

        let id = dev.id();
        dev.update_info(|info| {
            info.description = product_name(id.vendor_id, id.product_id).to_string();
            info.capabilities = CAN_CHANNEL_CAP_EXTENDED_CAN;
        });
        dev.arm_read()?;
        self.map_channel(dev)?;
        self.query_software_details(dev)
    }

    fn set_bus_params(&self, dev: &Device, params: BusParams) -> Result<()> {
        let timing = lookup_timing(&NOMINAL_TIMINGS, params.freq)?;
        self.check_nominal(dev, &timing)?;
        let trans_id = Self::trans_id(dev);
        let cmd = ProCommand::set_bus_params(self.address(), trans_id, dev.id().channel, &timing);
        self.request(
            dev,
            ResponseKey::with_trans_id(CMD_SET_BUSPARAMS_RESP, trans_id),
            cmd,
        )?;
        dev.update_timing(|t| t.nominal = Some(timing));
        debug!("{}: bus params {}", dev.handle(), timing);
        Ok(())
    }

    fn set_bus_params_fd(&self, dev: &Device, params: BusParamsFd) -> Result<()> {
        if !dev.is_fd() {
            return Err(CanError::Param("channel not opened in CAN FD mode"));
        }
        let data = lookup_timing(&DATA_TIMINGS, params.freq)?;
        check_prescaler(FD_CLOCK_HZ, data.freq, 1 + data.tseg1 + data.tseg2, 1..=256)?;
        let nominal = dev
            .timing()
            .nominal
            .ok_or(CanError::Param("nominal bus params not set"))?;
        let trans_id = Self::trans_id(dev);
        let cmd = ProCommand::set_bus_params_fd(self.address(), trans_id, &nominal, &data);
        self.request(
            dev,
            ResponseKey::with_trans_id(CMD_SET_BUSPARAMS_RESP, trans_id),
            cmd,
        )?;
        dev.update_timing(|t| t.data = Some(data));
        Ok(())
    }

    fn bus_on(&self, dev: &Device) -> Result<()> {
        let cmd = ProCommand::standard(CMD_START_CHIP_REQ, self.address(), Self::trans_id(dev));
        // Answered by a chip state event, which carries no transaction id
        let resp = self.request(dev, ResponseKey::command(CMD_CHIP_STATE_EVENT), cmd)?;
        if let Some(ProEvent::ChipState {
            tx_errors,
            rx_errors,
            bus_status,
        }) = decode_standard(&resp)
        {
            match decode_bus_status(bus_status) {
                Some(status) => dev.apply_start_state(status, tx_errors, rx_errors),
                None => warn!("{}: unknown bus status 0x{bus_status:02x}", dev.handle()),
            }
        }
        Ok(())
    }

    fn bus_off(&self, dev: &Device) -> Result<()> {
        let trans_id = Self::trans_id(dev);
        let cmd = ProCommand::standard(CMD_STOP_CHIP_REQ, self.address(), trans_id);
        self.request(
            dev,
            ResponseKey::with_trans_id(CMD_STOP_CHIP_RESP, trans_id),
            cmd,
        )?;
        Ok(())
    }

    fn write(
        &self,
        dev: &Device,
        id: u32,
        payload: &[u8],
        dlc: usize,
        flags: u32,
    ) -> Result<()> {
        let fd = flags & CANFD_MSG_FDF != 0;
        if fd && !(dev.is_fd() && self.is_extended()) {
            return Err(CanError::Param("CAN FD frame on a classic channel"));
        }
        let len = payload_len(dlc, flags)?;
        let data = copy_payload(payload, len);
        let trans_id = Self::trans_id(dev);
        let cmd = if self.is_extended() {
            ProCommand::tx_message_fd(self.address(), trans_id, id, &data[..len], flags)
        } else {
            ProCommand::tx_message(
                self.address(),
                trans_id,
                dev.id().channel,
                id,
                &data[..len],
                flags,
            )
        };
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
        let align = dev.endpoints().bulk_in.max_packet_size as usize;
        for frame in split_frames(buf, align) {
            let (event, cmd) = if frame[0] == CMD_EXTENDED {
                (decode_extended(frame), frame[6])
            } else {
                (decode_standard(frame), frame[0])
            };
            let trans_id = le_u16(frame, 2);
            dev.correlator().complete(cmd, Some(trans_id), frame);
            match event {
                Some(event) => self.handle_event(dev, event),
                None => warn!("{}: short hydra command {cmd}", dev.handle()),
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
