//! IXXAT USB-to-CAN FD
//!
//! Control commands travel as vendor control transfers: the request and a
//! response header template go out, then the response is read back. CAN
//! messages use variable length records on a per-channel bulk pipe pair.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::backend::{lookup_timing, Backend, BackendKind};
use crate::config::Config;
use crate::constants::*;
use crate::device::Device;
use crate::error::{CanError, Result};
use crate::message::{copy_payload, decode_fd_dlc, encode_fd_dlc, le_u16, le_u32, payload_len, CanMsg};
use crate::pipeline::{TransmitPipeline, WireRecord};
use crate::structures::{
    BusParams, BusParamsFd, BusStatus, Direction, EndpointDescriptor, Endpoints,
};

pub const CMD_POWER_DEV: u32 = 0x421;
pub const CMD_CAPS_DEV: u32 = 0x401;
pub const CMD_START_CHIP: u32 = 0x326;
pub const CMD_STOP_CHIP: u32 = 0x327;
pub const CMD_INIT_CHIP: u32 = 0x337;

const VENDOR_OUT: u8 = 0x40;
const VENDOR_IN: u8 = 0xC0;
const VENDOR_REQUEST: u8 = 0xFF;

/// Port and socket value addressing the device rather than a channel
const ANY: u16 = 0xFFFF;
const REQ_HEADER_LEN: usize = 12;
const RESP_HEADER_LEN: usize = 12;
const CAPS_RESP_LEN: usize = RESP_HEADER_LEN + 2 + 64;
const START_RESP_LEN: usize = RESP_HEADER_LEN + 4;
const STOP_ACTION: u32 = 3;
const CHANNEL_TYPE_CAN: u16 = 0x100;

pub const OPMODE_STANDARD: u8 = 0x01;
pub const OPMODE_EXTENDED: u8 = 0x02;
pub const EXMODE_EXTDATA: u8 = 0x01;
pub const EXMODE_FASTDATA: u8 = 0x02;
pub const EXMODE_ISOFD: u8 = 0x04;

// Record types (low byte of the flags)
pub const CAN_DATA: u32 = 0x00;
pub const CAN_INFO: u32 = 0x01;
pub const CAN_ERROR: u32 = 0x02;
pub const CAN_STATUS: u32 = 0x03;

pub const MSG_FLAG_TYPE: u32 = 0x0000_00FF;
pub const MSG_FLAG_EDL: u32 = 0x0000_0400;
pub const MSG_FLAG_FDR: u32 = 0x0000_0800;
pub const MSG_FLAG_ESI: u32 = 0x0000_1000;
pub const MSG_FLAG_DLC: u32 = 0x000F_0000;
pub const MSG_FLAG_OVR: u32 = 0x0010_0000;
pub const MSG_FLAG_SRR: u32 = 0x0020_0000;
pub const MSG_FLAG_RTR: u32 = 0x0040_0000;
pub const MSG_FLAG_EXT: u32 = 0x0080_0000;

pub const STATUS_ERRLIM: u32 = 0x0004;
pub const STATUS_BUSOFF: u32 = 0x0008;
pub const STATUS_ERR_PAS: u32 = 0x2000;

/// Record header: size, time, id, flags, client id
const MSG_HEADER_LEN: usize = 17;
pub const MSG_MAX_LEN: usize = MSG_HEADER_LEN + CANFD_MAX_DLEN;

/// Nominal bitrates: prescaler, tseg1, tseg2, sjw at 80 MHz
const NOMINAL_TIMINGS: [(i64, BusParams); 7] = [
    (CAN_BITRATE_1M, BusParams::new(5, 13, 2, 1)),
    (CAN_BITRATE_500K, BusParams::new(10, 13, 2, 1)),
    (CAN_BITRATE_250K, BusParams::new(20, 13, 2, 1)),
    (CAN_BITRATE_125K, BusParams::new(40, 13, 2, 1)),
    (CAN_BITRATE_100K, BusParams::new(50, 13, 2, 1)),
    (CAN_BITRATE_83K, BusParams::new(60, 13, 2, 1)),
    (CAN_BITRATE_50K, BusParams::new(100, 13, 2, 1)),
];

/// Data phase bitrates, same layout
const DATA_TIMINGS: [(i64, BusParams); 4] = [
    (CANFD_BITRATE_4M_80P, BusParams::new(2, 7, 2, 2)),
    (CANFD_BITRATE_2M_80P, BusParams::new(2, 15, 4, 4)),
    (CANFD_BITRATE_1M_80P, BusParams::new(4, 15, 4, 4)),
    (CANFD_BITRATE_500K_80P, BusParams::new(8, 15, 4, 4)),
];

/// Control request with its response header template appended
pub fn encode_request(code: u32, port: u16, body: &[u8], resp_len: usize) -> Vec<u8> {
    let req_size = (REQ_HEADER_LEN + body.len()) as u32;
    let mut out = Vec::with_capacity(req_size as usize + RESP_HEADER_LEN);
    out.extend_from_slice(&req_size.to_le_bytes());
    out.extend_from_slice(&port.to_le_bytes());
    out.extend_from_slice(&ANY.to_le_bytes());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&(resp_len as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&u32::MAX.to_le_bytes());
    out
}

fn encode_bit_timing(out: &mut Vec<u8>, mode: u32, timing: Option<&BusParams>, tdo: u16) {
    let (bps, tseg1, tseg2, sjw) = match timing {
        Some(t) => (t.freq as u32, t.tseg1 as u16, t.tseg2 as u16, t.sjw as u16),
        None => (0, 0, 0, 0),
    };
    out.extend_from_slice(&mode.to_le_bytes());
    out.extend_from_slice(&bps.to_le_bytes());
    out.extend_from_slice(&tseg1.to_le_bytes());
    out.extend_from_slice(&tseg2.to_le_bytes());
    out.extend_from_slice(&sjw.to_le_bytes());
    out.extend_from_slice(&tdo.to_le_bytes());
}

/// Body of the INIT request
pub fn encode_init(fd: bool, nominal: &BusParams, data: Option<&BusParams>) -> Vec<u8> {
    let mut body = Vec::with_capacity(36);
    body.push(OPMODE_STANDARD | OPMODE_EXTENDED);
    body.push(if fd {
        EXMODE_EXTDATA | EXMODE_FASTDATA | EXMODE_ISOFD
    } else {
        0
    });
    encode_bit_timing(&mut body, 1, Some(nominal), 0);
    match data.filter(|_| fd) {
        Some(data) => encode_bit_timing(&mut body, 0, Some(data), 1 + data.tseg1 as u16),
        None => encode_bit_timing(&mut body, 0, None, 0),
    }
    body.extend_from_slice(&[0, 0]);
    body
}

/// Number of CAN channels in a CAPS response
pub fn count_can_channels(resp: &[u8]) -> u8 {
    if resp.len() < RESP_HEADER_LEN + 2 {
        return 0;
    }
    let reported = le_u16(resp, RESP_HEADER_LEN) as usize;
    (0..reported.min(32))
        .filter(|&i| RESP_HEADER_LEN + 4 + 2 * i <= resp.len())
        .filter(|&i| le_u16(resp, RESP_HEADER_LEN + 2 + 2 * i) & CHANNEL_TYPE_CAN != 0)
        .count() as u8
}

/// One CAN message record on the bulk pipe
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IxxatMessage {
    bytes: [u8; MSG_MAX_LEN],
}

impl IxxatMessage {
    /// Encode an outbound message; `data` is the payload of `data.len()` bytes
    pub fn new(id: u32, data: &[u8], flags: u32) -> Result<Self> {
        let code = encode_fd_dlc(data.len());
        if code == INVALID_DLC || data.len() > CANFD_MAX_DLEN {
            return Err(CanError::Param("dlc has no CAN FD length code"));
        }
        let mut msg_flags = (code as u32) << 16;
        if flags & CAN_MSG_EXT != 0 {
            msg_flags |= MSG_FLAG_EXT;
        }
        if flags & CAN_MSG_RTR != 0 {
            msg_flags |= MSG_FLAG_RTR;
        }
        if flags & CANFD_MSG_FDF != 0 {
            msg_flags |= MSG_FLAG_EDL;
            if flags & CANFD_MSG_BRS != 0 {
                msg_flags |= MSG_FLAG_FDR;
            }
        }
        let mut bytes = [0u8; MSG_MAX_LEN];
        bytes[0] = (MSG_HEADER_LEN - 1 + data.len()) as u8;
        bytes[5..9].copy_from_slice(&id.to_le_bytes());
        bytes[9..13].copy_from_slice(&msg_flags.to_le_bytes());
        bytes[MSG_HEADER_LEN..MSG_HEADER_LEN + data.len()].copy_from_slice(data);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.bytes[0] as usize + 1]
    }
}

impl WireRecord for IxxatMessage {
    const MAX_LEN: usize = MSG_MAX_LEN;
    const TERMINATOR: &'static [u8] = &[];

    fn encoded_len(&self) -> usize {
        self.bytes[0] as usize + 1
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl std::fmt::Debug for IxxatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IxxatMessage({:02x?})", self.as_bytes())
    }
}

/// A decoded inbound record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IxxatEvent {
    Message(CanMsg),
    Status(BusStatus),
    Error(CanMsg),
    Other(u32),
}

/// Decode one record, including its size byte
pub fn decode_record(record: &[u8]) -> Option<IxxatEvent> {
    if record.len() < MSG_HEADER_LEN {
        return None;
    }
    let time = le_u32(record, 1);
    let id = le_u32(record, 5);
    let flags = le_u32(record, 9);
    let data = &record[MSG_HEADER_LEN..];
    let event = match flags & MSG_FLAG_TYPE {
        CAN_DATA => {
            let mut len = decode_fd_dlc(((flags & MSG_FLAG_DLC) >> 16) as u8);
            let mut canlib = 0;
            if flags & MSG_FLAG_EDL != 0 {
                canlib |= CANFD_MSG_FDF;
            } else {
                len = len.min(CAN_MAX_DLEN);
            }
            if flags & MSG_FLAG_FDR != 0 {
                canlib |= CANFD_MSG_BRS;
            }
            if flags & MSG_FLAG_ESI != 0 {
                canlib |= CANFD_MSG_ESI;
            }
            canlib |= if flags & MSG_FLAG_EXT != 0 {
                CAN_MSG_EXT
            } else {
                CAN_MSG_STD
            };
            if flags & MSG_FLAG_OVR != 0 {
                canlib |= CAN_MSGERR_HW_OVERRUN;
            }
            let payload = if flags & MSG_FLAG_RTR != 0 {
                canlib |= CAN_MSG_RTR;
                &[][..]
            } else {
                &data[..len.min(data.len())]
            };
            let mut msg = CanMsg::new(id, payload, canlib);
            if flags & MSG_FLAG_RTR != 0 {
                msg.dlc = len as u8;
            }
            msg.timestamp = time as u64;
            IxxatEvent::Message(msg)
        }
        CAN_STATUS => {
            if data.len() < 4 {
                return None;
            }
            let status = le_u32(data, 0);
            IxxatEvent::Status(if status & STATUS_BUSOFF != 0 {
                BusStatus::BusOff
            } else if status & STATUS_ERR_PAS != 0 {
                BusStatus::ErrorPassive
            } else {
                BusStatus::ErrorActive
            })
        }
        CAN_ERROR => {
            let n = data.len().min(CAN_MAX_DLEN);
            let mut msg = CanMsg::new(0, &data[..n], CAN_MSG_ERROR_FRAME);
            msg.timestamp = time as u64;
            IxxatEvent::Error(msg)
        }
        other => IxxatEvent::Other(other),
    };
    Some(event)
}

/// Split a bulk-in buffer into records; a zero size byte ends the buffer
///
/// No more records are taken than headers fit in the buffer.
pub fn split_records(buf: &[u8]) -> Vec<&[u8]> {
    let max_records = buf.len() / MSG_HEADER_LEN;
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let size = buf[pos] as usize;
        if size == 0 {
            break;
        }
        if records.len() == max_records {
            warn!("more than {max_records} IXXAT records in {} bytes", buf.len());
            break;
        }
        let end = pos + size + 1;
        if end > buf.len() {
            warn!("truncated IXXAT record at offset {pos}");
            break;
        }
        records.push(&buf[pos..end]);
        pos = end;
    }
    records
}

/// IXXAT USB-to-CAN FD backend state
pub struct IxxatBackend {
    capacity: usize,
    retries: u32,
    power_settle: Duration,
    tx: OnceLock<TransmitPipeline<IxxatMessage>>,
}

impl IxxatBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            capacity: config.ixxat_tx_buffer_capacity,
            retries: config.control_retries.max(1),
            power_settle: config.power_settle,
            tx: OnceLock::new(),
        }
    }

    fn pipeline(&self) -> Result<&TransmitPipeline<IxxatMessage>> {
        self.tx.get().ok_or(CanError::NotInitialized)
    }

    fn retry<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut last = CanError::Internal("no attempt".into());
        for attempt in 0..self.retries {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    trace!("control transfer attempt {attempt} failed: {e}");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Send a request and read its response; `port` addresses the channel
    fn command(
        &self,
        dev: &Device,
        code: u32,
        port: u16,
        body: &[u8],
        resp_len: usize,
        settle: Duration,
    ) -> Result<Vec<u8>> {
        let request = encode_request(code, port, body, resp_len);
        self.retry(|| dev.control_out(VENDOR_OUT, VENDOR_REQUEST, port, 0, &request))?;
        if !settle.is_zero() {
            thread::sleep(settle);
        }
        let mut resp = vec![0u8; resp_len];
        self.retry(|| {
            let n = dev.control_in(VENDOR_IN, VENDOR_REQUEST, port, 0, &mut resp)?;
            if n < RESP_HEADER_LEN || (le_u32(&resp, 4) as usize) < resp_len {
                return Err(CanError::InvalidResponse {
                    expected: resp_len,
                    actual: n,
                });
            }
            Ok(())
        })?;
        let ret_code = le_u32(&resp, 8);
        if ret_code != 0 {
            return Err(CanError::Hardware(format!(
                "command 0x{code:03x} returned 0x{ret_code:08x}"
            )));
        }
        Ok(resp)
    }

    fn port(dev: &Device) -> u16 {
        dev.id().channel as u16
    }

    fn send_init(&self, dev: &Device) -> Result<()> {
        let timing = dev.timing();
        let nominal = timing
            .nominal
            .ok_or(CanError::Param("nominal bus params not set"))?;
        let data = timing.data.map(|d| BusParams::new(d.freq, d.tseg1, d.tseg2, d.sjw));
        let body = encode_init(dev.is_fd(), &nominal, data.as_ref());
        self.command(
            dev,
            CMD_INIT_CHIP,
            Self::port(dev),
            &body,
            RESP_HEADER_LEN,
            Duration::ZERO,
        )?;
        Ok(())
    }
}

impl Backend for IxxatBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::IxxatFd
    }

    /// Bulk pair `channel + 1` of each direction; the first pair carries commands
    fn select_endpoints(&self, discovered: &[EndpointDescriptor], channel: u8) -> Result<Endpoints> {
        let nth = |direction: Direction| {
            discovered
                .iter()
                .filter(|ep| ep.direction == direction)
                .nth(channel as usize + 1)
                .copied()
                .ok_or(CanError::NotFound)
        };
        let bulk_out = nth(Direction::Out)?;
        Ok(Endpoints {
            bulk_in: nth(Direction::In)?,
            bulk_out,
            command_out: bulk_out,
        })
    }

    fn init_hardware(&self, dev: &Device) -> Result<()> {
        let max_packet = dev.endpoints().bulk_out.max_packet_size as usize;
        let pipeline = TransmitPipeline::new(self.capacity, max_packet, false)?;
        if self.tx.set(pipeline).is_err() {
            return Err(CanError::Internal("IXXAT already initialised".into()));
        }

        // Power and capabilities are per adapter, queried by its first channel
        if dev.id().channel == 0 {
            self.command(dev, CMD_POWER_DEV, ANY, &[0, 0, 0, 0], RESP_HEADER_LEN, self.power_settle)?;
            let caps = self.command(dev, CMD_CAPS_DEV, ANY, &[], CAPS_RESP_LEN, Duration::ZERO)?;
            let count = count_can_channels(&caps);
            debug!("{}: {count} CAN channels", dev.handle());
            dev.set_channel_count(count);
        }

        let channel = dev.id().channel;
        let count = dev.channel_count();
        dev.update_info(|info| {
            info.description = format!("IXXAT USB-to-CAN FD {}/{}", channel + 1, count);
            info.capabilities = CAN_CHANNEL_CAP_EXTENDED_CAN | CAN_CHANNEL_CAP_CAN_FD;
        });
        dev.arm_read()
    }

    fn set_bus_params(&self, dev: &Device, params: BusParams) -> Result<()> {
        let timing = lookup_timing(&NOMINAL_TIMINGS, params.freq)?;
        dev.update_timing(|t| {
            t.nominal = Some(timing);
            if t.data.is_none() {
                t.data = Some(timing.into());
            }
        });
        self.send_init(dev)
    }

    fn set_bus_params_fd(&self, dev: &Device, params: BusParamsFd) -> Result<()> {
        let timing = lookup_timing(&DATA_TIMINGS, params.freq)?;
        dev.update_timing(|t| t.data = Some(timing.into()));
        self.send_init(dev)
    }

    fn bus_on(&self, dev: &Device) -> Result<()> {
        let resp = self.command(
            dev,
            CMD_START_CHIP,
            Self::port(dev),
            &[],
            START_RESP_LEN,
            Duration::ZERO,
        )?;
        trace!("{}: started at {}", dev.handle(), le_u32(&resp, RESP_HEADER_LEN));
        Ok(())
    }

    fn bus_off(&self, dev: &Device) -> Result<()> {
        self.command(
            dev,
            CMD_STOP_CHIP,
            Self::port(dev),
            &STOP_ACTION.to_le_bytes(),
            RESP_HEADER_LEN,
            Duration::ZERO,
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
        if flags & CANFD_MSG_FDF != 0 && !dev.is_fd() {
            return Err(CanError::Param("CAN FD frame on a classic channel"));
        }
        let len = payload_len(dlc, flags)?;
        let data = copy_payload(payload, len);
        let record = IxxatMessage::new(id, &data[..len], flags)?;
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
        Ok(())
    }

    fn process_read(&self, dev: &Device, buf: &[u8]) {
        for record in split_records(buf) {
            match decode_record(record) {
                Some(IxxatEvent::Message(msg)) | Some(IxxatEvent::Error(msg)) => {
                    dev.push_event(msg)
                }
                Some(IxxatEvent::Status(status)) => {
                    let chip = dev.chip_state();
                    dev.apply_chip_state(Some(status), chip.tx_errors, chip.rx_errors);
                }
                Some(IxxatEvent::Other(kind)) => {
                    trace!("{}: record type {kind} ignored", dev.handle())
                }
                None => warn!("{}: short IXXAT record", dev.handle()),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32, flags: u32, data: &[u8]) -> Vec<u8> {
        let mut r = vec![(MSG_HEADER_LEN - 1 + data.len()) as u8];
        r.extend_from_slice(&1000u32.to_le_bytes());
        r.extend_from_slice(&id.to_le_bytes());
        r.extend_from_slice(&flags.to_le_bytes());
        r.extend_from_slice(&0u32.to_le_bytes());
        r.extend_from_slice(data);
        r
    }

    #[test]
    fn test_encode_request() {
        let req = encode_request(CMD_STOP_CHIP, 1, &STOP_ACTION.to_le_bytes(), RESP_HEADER_LEN);
        assert_eq!(req.len(), 16 + RESP_HEADER_LEN);
        assert_eq!(le_u32(&req, 0), 16);
        assert_eq!(le_u16(&req, 4), 1);
        assert_eq!(le_u16(&req, 6), ANY);
        assert_eq!(le_u32(&req, 8), CMD_STOP_CHIP);
        assert_eq!(le_u32(&req, 12), 3);
        assert_eq!(le_u32(&req, 16), RESP_HEADER_LEN as u32);
        assert_eq!(le_u32(&req, 24), u32::MAX);
    }

    #[test]
    fn test_encode_init() {
        let nominal = lookup_timing(&NOMINAL_TIMINGS, CAN_BITRATE_500K).unwrap();
        let data = lookup_timing(&DATA_TIMINGS, CANFD_BITRATE_2M_80P).unwrap();
        let body = encode_init(true, &nominal, Some(&data));
        assert_eq!(body.len(), 36);
        assert_eq!(body[0], OPMODE_STANDARD | OPMODE_EXTENDED);
        assert_eq!(body[1], EXMODE_EXTDATA | EXMODE_FASTDATA | EXMODE_ISOFD);
        assert_eq!(le_u32(&body, 2), 1);
        assert_eq!(le_u32(&body, 6), 10);
        assert_eq!(le_u16(&body, 10), 13);
        // fd.tdo = 1 + tseg1
        assert_eq!(le_u32(&body, 22), 2);
        assert_eq!(le_u16(&body, 32), 16);

        let body = encode_init(false, &nominal, Some(&data));
        assert_eq!(body[1], 0);
        assert_eq!(le_u32(&body, 22), 0);
    }

    #[test]
    fn test_timing_tables_per_phase() {
        assert!(lookup_timing(&NOMINAL_TIMINGS, CAN_BITRATE_250K).is_ok());
        assert!(matches!(
            lookup_timing(&NOMINAL_TIMINGS, CANFD_BITRATE_2M_80P),
            Err(CanError::Param(_))
        ));
        assert!(lookup_timing(&DATA_TIMINGS, CANFD_BITRATE_4M_80P).is_ok());
        assert!(matches!(
            lookup_timing(&DATA_TIMINGS, CAN_BITRATE_1M),
            Err(CanError::Param(_))
        ));
    }

    #[test]
    fn test_message_record_layout() {
        let msg = IxxatMessage::new(0x123, &[1, 2, 3], CAN_MSG_STD | CAN_MSG_RTR).unwrap();
        let b = msg.as_bytes();
        assert_eq!(b.len(), 20);
        assert_eq!(b[0], 19);
        assert_eq!(le_u32(b, 5), 0x123);
        assert_eq!(le_u32(b, 9), (3 << 16) | MSG_FLAG_RTR);
        assert_eq!(&b[17..20], &[1, 2, 3]);

        let fd = IxxatMessage::new(1, &[0; 12], CANFD_MSG_FDF | CANFD_MSG_BRS).unwrap();
        assert_eq!(le_u32(fd.as_bytes(), 9), (9 << 16) | MSG_FLAG_EDL | MSG_FLAG_FDR);
        assert!(IxxatMessage::new(1, &[0; 9], CANFD_MSG_FDF).is_err());
    }

    #[test]
    fn test_decode_data_record() {
        let rec = record(0x1FFF_FFFF, MSG_FLAG_EXT | MSG_FLAG_EDL | (13 << 16), &[7; 32]);
        let Some(IxxatEvent::Message(msg)) = decode_record(&rec) else {
            panic!("not a message");
        };
        assert_eq!(msg.id, 0x1FFF_FFFF);
        assert_eq!(msg.flags, CAN_MSG_EXT | CANFD_MSG_FDF);
        assert_eq!(msg.dlc, 32);
        assert_eq!(msg.timestamp, 1000);

        // Classic frames are clamped to 8 bytes
        let rec = record(0x10, 12 << 16, &[1; 24]);
        let Some(IxxatEvent::Message(msg)) = decode_record(&rec) else {
            panic!("not a message");
        };
        assert_eq!(msg.dlc, 8);
        assert_eq!(msg.flags, CAN_MSG_STD);
    }

    #[test]
    fn test_decode_status_record() {
        let rec = record(0, CAN_STATUS, &STATUS_BUSOFF.to_le_bytes());
        assert_eq!(decode_record(&rec), Some(IxxatEvent::Status(BusStatus::BusOff)));
        let rec = record(0, CAN_STATUS, &STATUS_ERR_PAS.to_le_bytes());
        assert_eq!(
            decode_record(&rec),
            Some(IxxatEvent::Status(BusStatus::ErrorPassive))
        );
    }

    #[test]
    fn test_split_records() {
        let mut buf = record(1, 1 << 16, &[0xAA]);
        buf.extend(record(2, 0, &[]));
        buf.extend([0u8; 16]);
        let records = split_records(&buf);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].len(), 18);
        assert_eq!(records[1].len(), 17);
    }

    #[test]
    fn test_split_records_corrupt_size() {
        // Size byte 1 would yield a two byte record per step
        let buf = [1u8; 68];
        let records = split_records(&buf);
        assert_eq!(records.len(), 68 / MSG_HEADER_LEN);
        assert!(records.iter().all(|r| decode_record(r).is_none()));

        assert!(split_records(&[1u8; 16]).is_empty());
    }

    #[test]
    fn test_select_endpoints_per_channel() {
        let backend = IxxatBackend::new(&Config::default());
        let eps = [
            EndpointDescriptor::bulk_in(0x81, 512),
            EndpointDescriptor::bulk_out(0x01, 512),
            EndpointDescriptor::bulk_in(0x82, 512),
            EndpointDescriptor::bulk_out(0x02, 512),
            EndpointDescriptor::bulk_in(0x83, 512),
            EndpointDescriptor::bulk_out(0x03, 512),
        ];
        let ch0 = backend.select_endpoints(&eps, 0).unwrap();
        assert_eq!(ch0.bulk_in.address, 0x82);
        assert_eq!(ch0.bulk_out.address, 0x02);
        let ch1 = backend.select_endpoints(&eps, 1).unwrap();
        assert_eq!(ch1.bulk_in.address, 0x83);
        assert!(matches!(
            backend.select_endpoints(&eps, 2),
            Err(CanError::NotFound)
        ));
    }

    #[test]
    fn test_count_can_channels() {
        let mut resp = vec![0u8; CAPS_RESP_LEN];
        resp[12..14].copy_from_slice(&3u16.to_le_bytes());
        resp[14..16].copy_from_slice(&0x0101u16.to_le_bytes());
        resp[16..18].copy_from_slice(&0x0001u16.to_le_bytes());
        resp[18..20].copy_from_slice(&0x0100u16.to_le_bytes());
        assert_eq!(count_can_channels(&resp), 2);
    }
}
