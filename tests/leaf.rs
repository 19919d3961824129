mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use canlib_usb::backend::leaf;
use canlib_usb::structures::BUS_STATUS_PASSIVE;
use canlib_usb::*;
use common::*;

const WAIT: Duration = Duration::from_secs(2);

fn attach_leaf(registry: &Registry, mock: &Arc<MockTransport>) -> CanHandle {
    registry
        .attach(
            Arc::clone(mock) as Arc<dyn Transport>,
            KVASER_VENDOR_ID,
            KVASER_LEAF_LIGHT_V2_PRODUCT_ID,
            &leaf_endpoints(),
        )
        .unwrap()
}

fn read_next(registry: &Registry, handle: CanHandle) -> CanMsg {
    let mut received = None;
    assert!(wait_until(WAIT, || match registry.read(handle) {
        Ok(msg) => {
            received = Some(msg);
            true
        }
        Err(CanError::NoMsg) => false,
        Err(e) => panic!("read failed: {e}"),
    }));
    received.unwrap()
}

fn chip_state_event(bus_status: u8, tx_errors: u8, rx_errors: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 16];
    frame[0] = 16;
    frame[1] = leaf::CMD_CHIP_STATE_EVENT;
    frame[10] = tx_errors;
    frame[11] = rx_errors;
    frame[12] = bus_status;
    frame
}

#[test]
fn test_leaf_attach_queries_card() {
    init_logger();
    let registry = Registry::new(test_config());
    let mock = MockTransport::with_responder(leaf_firmware());
    let handle = attach_leaf(&registry, &mock);

    assert_eq!(handle, CanHandle::new(0));
    assert_eq!(registry.number_of_channels(), 1);
    assert_eq!(registry.backend_kind(handle).unwrap(), BackendKind::ClassicLeaf);
    assert!(wait_until(WAIT, || {
        let info = registry.device_info(handle).unwrap();
        info.serial_number == LEAF_SERIAL as u64 && info.firmware_version == LEAF_FIRMWARE
    }));
    assert_eq!(
        registry
            .channel_data(handle, CAN_CHANNELDATA_DEVDESCR_ASCII)
            .unwrap(),
        ChannelData::DeviceDescription("Kvaser Leaf Light v2".into())
    );
    assert_eq!(
        registry.channel_data(handle, CAN_CHANNELDATA_CARD_SERIAL_NO).unwrap(),
        ChannelData::CardSerialNo(LEAF_SERIAL as u64)
    );
    assert_eq!(
        registry.channel_data(handle, CAN_CHANNELDATA_CHANNEL_CAP).unwrap(),
        ChannelData::ChannelCapabilities(CAN_CHANNEL_CAP_EXTENDED_CAN)
    );
    assert!(matches!(
        registry.channel_data(handle, 99),
        Err(CanError::NotImplemented(_))
    ));

    // Card info, software info and the default bus params
    let commands: Vec<u8> = mock.written().iter().map(|(_, data)| data[1]).collect();
    assert_eq!(
        &commands[..3],
        &[
            leaf::CMD_GET_CARD_INFO_REQ,
            leaf::CMD_GET_SOFTWARE_INFO_REQ,
            leaf::CMD_SET_BUSPARAMS_REQ
        ]
    );
}

#[test]
fn test_leaf_loopback() {
    init_logger();
    let registry = Registry::new(test_config());
    let mock = MockTransport::with_responder(leaf_firmware());
    attach_leaf(&registry, &mock);

    let handle = registry.open_channel(0, CAN_OPEN_EXCLUSIVE).unwrap();
    registry
        .set_bus_params(handle, CAN_BITRATE_500K, 0, 0, 0, 0, 0)
        .unwrap();
    assert_eq!(registry.read_status(handle).unwrap(), CAN_STAT_BUS_OFF);
    registry.bus_on(handle).unwrap();
    assert_eq!(registry.read_status(handle).unwrap(), CAN_STAT_ERROR_ACTIVE);

    // Seven payload bytes with dlc 8 go out zero padded
    registry.write(handle, 0x123, b"can4osx", 8, 0).unwrap();
    let msg = read_next(&registry, handle);
    assert_eq!(msg.id, 0x123);
    assert_eq!(msg.dlc, 8);
    assert_eq!(msg.payload(), b"can4osx\0");
    assert_eq!(msg.flags & CAN_MSG_STD, CAN_MSG_STD);
    assert_eq!(msg.timestamp, 100);

    registry
        .write(handle, 0x1ABC_DEF0, &[1, 2, 3], 3, CAN_MSG_EXT)
        .unwrap();
    let msg = read_next(&registry, handle);
    assert_eq!(msg.id, 0x1ABC_DEF0);
    assert!(msg.is_extended_id());
    assert_eq!(msg.payload(), &[1, 2, 3]);

    assert!(matches!(registry.read(handle), Err(CanError::NoMsg)));
    registry.bus_off(handle).unwrap();
    assert_eq!(registry.read_status(handle).unwrap(), CAN_STAT_BUS_OFF);
    registry.close(handle).unwrap();
}

#[test]
fn test_leaf_rejects_fd() {
    init_logger();
    let registry = Registry::new(test_config());
    let mock = MockTransport::with_responder(leaf_firmware());
    let handle = attach_leaf(&registry, &mock);

    assert!(matches!(
        registry.open_channel(0, CAN_OPEN_CAN_FD),
        Err(CanError::Param(_))
    ));
    registry.open_channel(0, CAN_OPEN_REQUIRE_EXTENDED).unwrap();
    assert!(matches!(
        registry.write(handle, 0x10, &[0; 12], 9, CAN_MSG_STD),
        Err(CanError::Param(_))
    ));
    assert!(matches!(
        registry.write(handle, 0x10, &[0; 8], 8, CAN_MSG_STD | CANFD_MSG_FDF),
        Err(CanError::Param(_))
    ));
    assert!(matches!(
        registry.set_bus_params(handle, 42, 0, 0, 0, 0, 0),
        Err(CanError::Param(_))
    ));
    assert!(matches!(
        registry.set_bus_params_fd(handle, CANFD_BITRATE_2M_80P, 0, 0, 0),
        Err(CanError::NotImplemented(_))
    ));
    assert_eq!(
        CanStatus::from_result(&registry.set_bus_params_fd(handle, CANFD_BITRATE_2M_80P, 0, 0, 0))
            .code(),
        CAN_ERR_NOT_IMPLEMENTED
    );
}

#[test]
fn test_leaf_bus_on_times_out() {
    init_logger();
    let config = test_config().with_response_timeout(Duration::from_millis(50));
    let registry = Registry::new(config);
    // Accepts every write, never answers
    let mock = MockTransport::new();
    let handle = attach_leaf(&registry, &mock);

    assert!(matches!(registry.bus_on(handle), Err(CanError::Timeout)));
    assert_eq!(registry.read_status(handle).unwrap(), CAN_STAT_BUS_OFF);

    assert_eq!(registry.pending_requests(handle).unwrap(), 0);

    // Transaction ids 1 to 3 went to the init requests, 4 to bus on. Its
    // late response is consumed by the worker and dropped.
    let armed = registry.pipe_stats(handle).unwrap().reads_armed;
    mock.push_inbound(LEAF_IN_EP, vec![4, leaf::CMD_START_CHIP_RESP, 4, 0]);
    assert!(wait_until(WAIT, || {
        registry.pipe_stats(handle).unwrap().reads_armed > armed
    }));
    assert_eq!(registry.pending_requests(handle).unwrap(), 0);
    assert_eq!(registry.read_status(handle).unwrap(), CAN_STAT_BUS_OFF);

    // Firmware that keeps replaying the stale response never satisfies the
    // next start request
    mock.set_responder(Box::new(|_endpoint, packet| {
        if packet.get(1) == Some(&leaf::CMD_START_CHIP_REQ) {
            vec![(LEAF_IN_EP, vec![4, leaf::CMD_START_CHIP_RESP, 4, 0])]
        } else {
            Vec::new()
        }
    }));
    assert!(matches!(registry.bus_on(handle), Err(CanError::Timeout)));
    assert_eq!(registry.pending_requests(handle).unwrap(), 0);

    // A fresh request gets its own response
    mock.set_responder(leaf_firmware());
    registry.bus_on(handle).unwrap();
    assert_eq!(registry.read_status(handle).unwrap(), CAN_STAT_ERROR_ACTIVE);
    assert_eq!(registry.pending_requests(handle).unwrap(), 0);
}

#[test]
fn test_leaf_read_rearmed_once_per_completion() {
    init_logger();
    let registry = Registry::new(test_config());
    let mock = MockTransport::new();
    let handle = attach_leaf(&registry, &mock);

    assert_eq!(registry.pipe_stats(handle).unwrap().reads_armed, 1);
    for passive in [false, true, false] {
        let status = if passive { BUS_STATUS_PASSIVE } else { 0 };
        mock.push_inbound(LEAF_IN_EP, chip_state_event(status, 3, 4));
    }
    assert!(wait_until(WAIT, || {
        registry.pipe_stats(handle).unwrap().reads_armed == 4
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(registry.pipe_stats(handle).unwrap().reads_armed, 4);
}

#[test]
fn test_leaf_chip_state_and_notifications() {
    init_logger();
    let registry = Registry::new(test_config());
    let mock = MockTransport::with_responder(leaf_firmware());
    let handle = attach_leaf(&registry, &mock);

    let (tx, rx) = mpsc::channel();
    registry
        .set_notify(handle, Some(tx), CAN_NOTIFY_RX | CAN_NOTIFY_STATUS)
        .unwrap();

    // Ignored while the chip is stopped
    mock.push_inbound(LEAF_IN_EP, chip_state_event(BUS_STATUS_PASSIVE, 130, 0));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(registry.read_status(handle).unwrap(), CAN_STAT_BUS_OFF);
    assert!(rx.try_recv().is_err());

    registry.bus_on(handle).unwrap();
    let note = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(note.handle, handle);
    assert!(note.is_status());

    mock.push_inbound(LEAF_IN_EP, chip_state_event(BUS_STATUS_PASSIVE, 130, 0));
    let note = rx.recv_timeout(WAIT).unwrap();
    assert!(note.is_status());
    assert_eq!(registry.read_status(handle).unwrap(), CAN_STAT_ERROR_PASSIVE);

    registry.write(handle, 0x42, &[7], 1, CAN_MSG_STD).unwrap();
    let note = rx.recv_timeout(WAIT).unwrap();
    assert!(note.is_rx());
    assert_eq!(registry.read(handle).unwrap().payload(), &[7]);

    registry.set_notify(handle, None, 0).unwrap();
    registry.write(handle, 0x42, &[8], 1, CAN_MSG_STD).unwrap();
    read_next(&registry, handle);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_leaf_transport_failure() {
    init_logger();
    let registry = Registry::new(test_config());
    let mock = MockTransport::with_responder(leaf_firmware());
    let handle = attach_leaf(&registry, &mock);
    registry.bus_on(handle).unwrap();

    mock.fail_reads();
    assert!(wait_until(WAIT, || matches!(
        registry.write(handle, 0x1, &[], 0, CAN_MSG_STD),
        Err(CanError::DeviceGone)
    )));
    assert!(mock.is_released());
    assert!(matches!(registry.bus_on(handle), Err(CanError::DeviceGone)));
    assert_eq!(
        CanStatus::from_result(&registry.read_status(handle)),
        CanStatus::ErrNoCard
    );
}

#[test]
fn test_leaf_detach_invalidates_handle() {
    init_logger();
    let registry = Registry::new(test_config());
    let mock = MockTransport::with_responder(leaf_firmware());
    let handle = attach_leaf(&registry, &mock);

    registry.detach(handle).unwrap();
    assert!(mock.is_released());
    assert_eq!(registry.number_of_channels(), 0);
    assert!(matches!(registry.bus_on(handle), Err(CanError::InvalidHandle(0))));
    assert!(matches!(registry.detach(handle), Err(CanError::InvalidHandle(0))));
    assert!(matches!(
        registry.open_channel(0, 0),
        Err(CanError::NotFound)
    ));

    // Slots are not reused
    let other = MockTransport::with_responder(leaf_firmware());
    let second = attach_leaf(&registry, &other);
    assert_eq!(second, CanHandle::new(1));
    assert!(matches!(registry.read(handle), Err(CanError::InvalidHandle(0))));
}

#[test]
fn test_leaf_max_channels() {
    init_logger();
    let registry = Registry::new(test_config().with_max_channels(1));
    let first = MockTransport::with_responder(leaf_firmware());
    attach_leaf(&registry, &first);

    let second = MockTransport::with_responder(leaf_firmware());
    let result = registry.attach(
        Arc::clone(&second) as Arc<dyn Transport>,
        KVASER_VENDOR_ID,
        KVASER_LEAF_SEMIPRO_HS_PRODUCT_ID,
        &leaf_endpoints(),
    );
    assert!(matches!(result, Err(CanError::NoChannels)));
    assert_eq!(registry.number_of_channels(), 1);
}

#[test]
fn test_unknown_product() {
    let registry = Registry::new(test_config());
    let mock = MockTransport::new();
    let result = registry.attach(
        mock as Arc<dyn Transport>,
        0x1D50,
        0x606F,
        &leaf_endpoints(),
    );
    assert!(matches!(result, Err(CanError::NotFound)));
    assert_eq!(registry.number_of_channels(), 0);
}

#[test]
fn test_leaf_tx_buffer_overflow() {
    init_logger();
    let registry = Registry::new(test_config().with_command_buffer_capacity(4));
    let mock = MockTransport::with_responder(leaf_firmware());
    let handle = attach_leaf(&registry, &mock);
    registry.bus_on(handle).unwrap();

    mock.hold_writes(true);
    let mut accepted = 0;
    let overflow = loop {
        match registry.write(handle, 0x100 + accepted, &[accepted as u8], 1, CAN_MSG_STD) {
            Ok(()) => accepted += 1,
            Err(e) => break e,
        }
        assert!(accepted < 64, "queue never filled");
    };
    assert!(matches!(overflow, CanError::TxBufferOverflow));
    assert_eq!(CanStatus::from(&overflow).code(), CAN_ERR_TXBUFOFL);

    mock.hold_writes(false);
    let mut ids = Vec::new();
    assert!(wait_until(WAIT, || {
        while let Ok(msg) = registry.read(handle) {
            ids.push(msg.id);
        }
        ids.len() == accepted as usize
    }));
    let expected: Vec<u32> = (0..accepted).map(|i| 0x100 + i).collect();
    assert_eq!(ids, expected);
    registry.write(handle, 0x7FF, &[], 0, CAN_MSG_STD).unwrap();
}
