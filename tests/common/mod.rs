//! Scripted USB device for the integration tests
//!
//! [`MockTransport`] records every transfer. A bulk responder plays the
//! adapter firmware: it sees each bulk-out write and returns the packets
//! the adapter would answer with, each tagged with its bulk-in endpoint.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use canlib_usb::backend::{ixxat, leaf, leaf_pro, peak};
use canlib_usb::{Config, EndpointDescriptor, Transport};

pub type BulkResponder = Box<dyn FnMut(u8, &[u8]) -> Vec<(u8, Vec<u8>)> + Send>;
pub type ControlResponder = Box<dyn FnMut(&ControlRequest) -> Option<Vec<u8>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct MockTransport {
    inbound: Mutex<HashMap<u8, VecDeque<Vec<u8>>>>,
    arrived: Condvar,
    written: Mutex<Vec<(u8, Vec<u8>)>>,
    controls: Mutex<Vec<ControlRequest>>,
    control_replies: Mutex<VecDeque<Vec<u8>>>,
    responder: Mutex<Option<BulkResponder>>,
    control_responder: Mutex<Option<ControlResponder>>,
    hold: Mutex<bool>,
    unheld: Condvar,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    released: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_responder(responder: BulkResponder) -> Arc<Self> {
        let mock = Self::new();
        *lock(&mock.responder) = Some(responder);
        mock
    }

    /// Replace the firmware that answers bulk writes
    pub fn set_responder(&self, responder: BulkResponder) {
        *lock(&self.responder) = Some(responder);
    }

    pub fn set_control_responder(&self, responder: ControlResponder) {
        *lock(&self.control_responder) = Some(responder);
    }

    /// Queue a packet on a bulk-in endpoint
    pub fn push_inbound(&self, endpoint: u8, packet: Vec<u8>) {
        lock(&self.inbound)
            .entry(endpoint)
            .or_default()
            .push_back(packet);
        self.arrived.notify_all();
    }

    pub fn written(&self) -> Vec<(u8, Vec<u8>)> {
        lock(&self.written).clone()
    }

    pub fn written_to(&self, endpoint: u8) -> Vec<Vec<u8>> {
        lock(&self.written)
            .iter()
            .filter(|(ep, _)| *ep == endpoint)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn controls(&self) -> Vec<ControlRequest> {
        lock(&self.controls).clone()
    }

    /// Block bulk-out writes until called again with `false`
    pub fn hold_writes(&self, hold: bool) {
        *lock(&self.hold) = hold;
        self.unheld.notify_all();
    }

    /// Make the pending and every later bulk-in read fail
    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::Release);
        self.arrived.notify_all();
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> rusb::Result<()> {
        if self.is_released() {
            return Err(rusb::Error::NoDevice);
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.check_usable()?;
        let mut inbound = lock(&self.inbound);
        let empty = |queues: &HashMap<u8, VecDeque<Vec<u8>>>| {
            queues.get(&endpoint).map_or(true, VecDeque::is_empty)
        };
        if empty(&inbound) && !self.fail_reads.load(Ordering::Acquire) {
            inbound = self
                .arrived
                .wait_timeout(inbound, timeout)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(rusb::Error::Io);
        }
        match inbound.get_mut(&endpoint).and_then(VecDeque::pop_front) {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Err(rusb::Error::Timeout),
        }
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        self.check_usable()?;
        {
            let mut held = lock(&self.hold);
            while *held && !self.is_released() {
                held = self.unheld.wait(held).unwrap_or_else(|e| e.into_inner());
            }
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(rusb::Error::Io);
        }
        lock(&self.written).push((endpoint, data.to_vec()));
        let replies = match lock(&self.responder).as_mut() {
            Some(responder) => responder(endpoint, data),
            None => Vec::new(),
        };
        for (ep, reply) in replies {
            self.push_inbound(ep, reply);
        }
        Ok(data.len())
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.check_usable()?;
        lock(&self.controls).push(ControlRequest {
            request_type,
            request,
            value,
            index,
            data: Vec::new(),
        });
        let reply = lock(&self.control_replies)
            .pop_front()
            .ok_or(rusb::Error::Pipe)?;
        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.check_usable()?;
        let req = ControlRequest {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        };
        if let Some(responder) = lock(&self.control_responder).as_mut() {
            if let Some(reply) = responder(&req) {
                lock(&self.control_replies).push_back(reply);
            }
        }
        lock(&self.controls).push(req);
        Ok(data.len())
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.arrived.notify_all();
        self.unheld.notify_all();
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short polls, generous response timeout
pub fn test_config() -> Config {
    Config::default()
        .with_read_poll_interval(Duration::from_millis(10))
        .with_response_timeout(Duration::from_millis(500))
        .with_power_settle(Duration::ZERO)
        .with_control_retries(2)
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

// ============================================================================
// Kvaser Leaf firmware
// ============================================================================

pub const LEAF_SERIAL: u32 = 12345;
pub const LEAF_IN_EP: u8 = 0x81;
pub const LEAF_FIRMWARE: u32 = 0x0003_0001;

pub fn leaf_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor::bulk_in(LEAF_IN_EP, 64),
        EndpointDescriptor::bulk_out(0x02, 64),
    ]
}

fn leaf_reply(frame: &[u8]) -> Option<Vec<u8>> {
    let (cmd, b2, b3) = (frame[1], frame[2], frame[3]);
    let reply = match cmd {
        leaf::CMD_GET_CARD_INFO_REQ => {
            let mut r = vec![0u8; 32];
            r[0] = 32;
            r[1] = leaf::CMD_GET_CARD_INFO_RESP;
            r[2] = b2;
            r[3] = 1;
            r[4..8].copy_from_slice(&LEAF_SERIAL.to_le_bytes());
            r
        }
        leaf::CMD_GET_SOFTWARE_INFO_REQ => {
            let mut r = vec![0u8; 32];
            r[0] = 32;
            r[1] = leaf::CMD_GET_SOFTWARE_INFO_RESP;
            r[2] = b2;
            r[8..12].copy_from_slice(&LEAF_FIRMWARE.to_le_bytes());
            r[12..14].copy_from_slice(&16u16.to_le_bytes());
            r
        }
        leaf::CMD_START_CHIP_REQ => vec![4, leaf::CMD_START_CHIP_RESP, b2, b3],
        leaf::CMD_STOP_CHIP_REQ => vec![4, leaf::CMD_STOP_CHIP_RESP, b2, b3],
        leaf::CMD_TX_STD_MESSAGE | leaf::CMD_TX_EXT_MESSAGE => {
            // Echo as a received message with a timestamp of 2400 ticks
            let mut r = vec![0u8; 24];
            r[0] = 24;
            r[1] = if cmd == leaf::CMD_TX_STD_MESSAGE {
                leaf::CMD_RX_STD_MESSAGE
            } else {
                leaf::CMD_RX_EXT_MESSAGE
            };
            r[2] = b2;
            r[3] = frame[19];
            r[4..6].copy_from_slice(&2400u16.to_le_bytes());
            r[10..24].copy_from_slice(&frame[4..18]);
            r
        }
        _ => return None,
    };
    Some(reply)
}

/// Answers Leaf requests and echoes transmitted messages
pub fn leaf_firmware() -> BulkResponder {
    Box::new(|_endpoint, packet| {
        let mut replies = Vec::new();
        let mut pos = 0;
        while pos < packet.len() && packet[pos] != 0 {
            let len = packet[pos] as usize;
            let frame = &packet[pos..(pos + len).min(packet.len())];
            if frame.len() >= 4 {
                replies.extend(leaf_reply(frame).map(|r| (LEAF_IN_EP, r)));
            }
            pos += len;
        }
        replies
    })
}

// ============================================================================
// Kvaser Leaf Pro firmware
// ============================================================================

pub const PRO_HE_ADDRESS: u8 = 5;
pub const PRO_FIRMWARE: u32 = 0x0005_0002;
pub const PRO_IN_EP: u8 = 0x81;

pub fn leaf_pro_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor::bulk_in(PRO_IN_EP, 512),
        EndpointDescriptor::bulk_out(0x02, 512),
    ]
}

fn pro_standard(cmd: u8, trans: &[u8]) -> Vec<u8> {
    let mut r = vec![0u8; leaf_pro::STD_CMD_LEN];
    r[0] = cmd;
    r[1] = PRO_HE_ADDRESS;
    r[2..4].copy_from_slice(trans);
    r
}

fn pro_reply(frame: &[u8], extended: bool) -> Option<Vec<u8>> {
    let trans = &frame[2..4];
    let reply = match frame[0] {
        leaf_pro::CMD_MAP_CHANNEL_REQ => {
            let mut r = pro_standard(leaf_pro::CMD_MAP_CHANNEL_RESP, trans);
            r[4] = PRO_HE_ADDRESS;
            r
        }
        leaf_pro::CMD_GET_SOFTWARE_DETAILS_REQ => {
            let mut r = pro_standard(leaf_pro::CMD_GET_SOFTWARE_DETAILS_RESP, trans);
            let mut flags = leaf_pro::SW_FLAG_CANFD;
            if extended {
                flags |= leaf_pro::SW_FLAG_EXT_CAP;
            }
            r[8..12].copy_from_slice(&flags.to_le_bytes());
            r[12..16].copy_from_slice(&PRO_FIRMWARE.to_le_bytes());
            r
        }
        leaf_pro::CMD_SET_BUSPARAMS_REQ | leaf_pro::CMD_SET_BUSPARAMS_FD_REQ => {
            pro_standard(leaf_pro::CMD_SET_BUSPARAMS_RESP, trans)
        }
        leaf_pro::CMD_START_CHIP_REQ => {
            // Chip state event: error active, no errors
            pro_standard(leaf_pro::CMD_CHIP_STATE_EVENT, &[0, 0])
        }
        leaf_pro::CMD_STOP_CHIP_REQ => pro_standard(leaf_pro::CMD_STOP_CHIP_RESP, trans),
        leaf_pro::CMD_TX_CAN_MESSAGE => {
            let mut r = pro_standard(leaf_pro::CMD_LOG_MESSAGE, trans);
            r[7] = frame[17];
            r[14] = frame[16];
            r[16..20].copy_from_slice(&frame[4..8]);
            r[20..28].copy_from_slice(&frame[8..16]);
            r
        }
        leaf_pro::CMD_EXTENDED if frame[6] == leaf_pro::CMD_EXT_TX_CAN_MESSAGE_FD => {
            let mut r = frame.to_vec();
            r[1] = PRO_HE_ADDRESS;
            r[6] = leaf_pro::CMD_EXT_RX_MESSAGE_FD;
            r[16..24].copy_from_slice(&[0; 8]);
            r[24] = 0;
            r[25] = frame[21];
            r
        }
        _ => return None,
    };
    Some(reply)
}

/// Hydra firmware; `extended` advertises the extended command capability
pub fn leaf_pro_firmware(extended: bool) -> BulkResponder {
    Box::new(move |_endpoint, packet| {
        let mut replies = Vec::new();
        let mut pos = 0;
        while pos + leaf_pro::STD_CMD_LEN <= packet.len() && packet[pos] != 0 {
            let len = if packet[pos] == leaf_pro::CMD_EXTENDED {
                u16::from_le_bytes([packet[pos + 4], packet[pos + 5]]) as usize
            } else {
                leaf_pro::STD_CMD_LEN
            };
            let frame = &packet[pos..(pos + len).min(packet.len())];
            replies.extend(pro_reply(frame, extended).map(|r| (PRO_IN_EP, r)));
            pos += len.max(1);
        }
        replies
    })
}

// ============================================================================
// IXXAT USB-to-CAN FD firmware
// ============================================================================

pub fn ixxat_endpoints() -> Vec<EndpointDescriptor> {
    (1..=3)
        .flat_map(|n| {
            [
                EndpointDescriptor::bulk_in(0x80 | n, 512),
                EndpointDescriptor::bulk_out(n, 512),
            ]
        })
        .collect()
}

fn ixxat_response(payload: &[u8], len: usize) -> Vec<u8> {
    let mut r = vec![0u8; len];
    r[0..4].copy_from_slice(&(len as u32).to_le_bytes());
    r[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    r[12..12 + payload.len()].copy_from_slice(payload);
    r
}

/// Control responder of an adapter with `channels` CAN channels
pub fn ixxat_control(channels: u16) -> ControlResponder {
    Box::new(move |req| {
        let code = u32::from_le_bytes([req.data[8], req.data[9], req.data[10], req.data[11]]);
        let reply = match code {
            ixxat::CMD_CAPS_DEV => {
                let mut payload = vec![0u8; 66];
                payload[0..2].copy_from_slice(&channels.to_le_bytes());
                for i in 0..channels as usize {
                    payload[2 + 2 * i..4 + 2 * i].copy_from_slice(&0x0101u16.to_le_bytes());
                }
                ixxat_response(&payload, 78)
            }
            ixxat::CMD_START_CHIP => ixxat_response(&7u32.to_le_bytes(), 16),
            _ => ixxat_response(&[], 12),
        };
        Some(reply)
    })
}

/// Echoes every message record back on the channel's bulk-in pipe
pub fn ixxat_firmware() -> BulkResponder {
    Box::new(|endpoint, packet| vec![(0x80 | endpoint, packet.to_vec())])
}

// ============================================================================
// PEAK PCAN-USB FD firmware
// ============================================================================

pub const PEAK_COMMAND_EP: u8 = 0x01;
pub const PEAK_MSG_OUT_EP: u8 = 0x02;
pub const PEAK_MSG_IN_EP: u8 = 0x82;

pub fn peak_endpoints() -> Vec<EndpointDescriptor> {
    vec![
        EndpointDescriptor::bulk_out(PEAK_COMMAND_EP, 512),
        EndpointDescriptor::bulk_in(0x81, 512),
        EndpointDescriptor::bulk_in(PEAK_MSG_IN_EP, 512),
        EndpointDescriptor::bulk_out(PEAK_MSG_OUT_EP, 512),
    ]
}

/// Loops transmitted records back as received records
pub fn peak_firmware() -> BulkResponder {
    Box::new(|endpoint, packet| {
        if endpoint != PEAK_MSG_OUT_EP {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 4 <= packet.len() {
            let size = u16::from_le_bytes([packet[pos], packet[pos + 1]]) as usize;
            if size == 0 || pos + size > packet.len() {
                break;
            }
            let tx = &packet[pos..pos + size];
            let data = &tx[20..];
            let rx_len = 28 + data.len();
            let mut rx = vec![0u8; (rx_len + 3) & !3];
            rx[0..2].copy_from_slice(&(rx_len as u16).to_le_bytes());
            rx[2..4].copy_from_slice(&peak::MSG_CAN_RX.to_le_bytes());
            rx[4..8].copy_from_slice(&100u32.to_le_bytes());
            rx[20] = tx[12];
            let flags = u16::from_le_bytes([tx[14], tx[15]]) | peak::MSG_FLAG_LOOPED_BACK;
            rx[22..24].copy_from_slice(&flags.to_le_bytes());
            rx[24..28].copy_from_slice(&tx[16..20]);
            rx[28..28 + data.len()].copy_from_slice(data);
            out.extend(rx);
            pos += size;
        }
        vec![(PEAK_MSG_IN_EP, out)]
    })
}
