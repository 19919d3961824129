//! canlib protocol constants
//!
//! Status codes, symbolic bitrates, message and status flags, open flags and
//! the USB identifiers of the supported adapters. Values match Kvaser canlib
//! so applications written against canlib keep their numeric meaning.

// ============================================================================
// Status Codes (canStatus)
// ============================================================================

/// Operation succeeded
pub const CAN_OK: i32 = 0;
/// Error in one or more parameters
pub const CAN_ERR_PARAM: i32 = -1;
/// No messages available
pub const CAN_ERR_NOMSG: i32 = -2;
/// Specified device or channel not found
pub const CAN_ERR_NOTFOUND: i32 = -3;
/// Out of memory
pub const CAN_ERR_NOMEM: i32 = -4;
/// No channels available
pub const CAN_ERR_NOCHANNELS: i32 = -5;
/// Interrupted by signal
pub const CAN_ERR_INTERRUPTED: i32 = -6;
/// Timeout occurred
pub const CAN_ERR_TIMEOUT: i32 = -7;
/// Library not initialized
pub const CAN_ERR_NOTINITIALIZED: i32 = -8;
/// Out of handles
pub const CAN_ERR_NOHANDLES: i32 = -9;
/// Handle is invalid
pub const CAN_ERR_INVHANDLE: i32 = -10;
/// Driver error
pub const CAN_ERR_DRIVER: i32 = -12;
/// Transmit buffer overflow
pub const CAN_ERR_TXBUFOFL: i32 = -13;
/// A hardware error has occurred
pub const CAN_ERR_HARDWARE: i32 = -15;
/// The card was removed or not inserted
pub const CAN_ERR_NOCARD: i32 = -26;
/// Internal error in the driver
pub const CAN_ERR_INTERNAL: i32 = -30;
/// Access denied
pub const CAN_ERR_NO_ACCESS: i32 = -31;
/// Not implemented
pub const CAN_ERR_NOT_IMPLEMENTED: i32 = -32;

// ============================================================================
// Symbolic Bitrates
// ============================================================================

/// 1 Mbit/s
pub const CAN_BITRATE_1M: i64 = -1;
/// 500 kbit/s
pub const CAN_BITRATE_500K: i64 = -2;
/// 250 kbit/s
pub const CAN_BITRATE_250K: i64 = -3;
/// 125 kbit/s
pub const CAN_BITRATE_125K: i64 = -4;
/// 100 kbit/s
pub const CAN_BITRATE_100K: i64 = -5;
/// 62 kbit/s
pub const CAN_BITRATE_62K: i64 = -6;
/// 50 kbit/s
pub const CAN_BITRATE_50K: i64 = -7;
/// 83 kbit/s
pub const CAN_BITRATE_83K: i64 = -8;
/// 10 kbit/s
pub const CAN_BITRATE_10K: i64 = -9;

/// CAN FD data phase 500 kbit/s, 80% sample point
pub const CANFD_BITRATE_500K_80P: i64 = -1000;
/// CAN FD data phase 1 Mbit/s, 80% sample point
pub const CANFD_BITRATE_1M_80P: i64 = -1001;
/// CAN FD data phase 2 Mbit/s, 80% sample point
pub const CANFD_BITRATE_2M_80P: i64 = -1002;
/// CAN FD data phase 4 Mbit/s, 80% sample point
pub const CANFD_BITRATE_4M_80P: i64 = -1003;
/// CAN FD data phase 8 Mbit/s, 60% sample point
pub const CANFD_BITRATE_8M_60P: i64 = -1004;

// ============================================================================
// Message Flags (canMSG_* / canFDMSG_*)
// ============================================================================

/// Remote transmission request
pub const CAN_MSG_RTR: u32 = 0x0001;
/// Standard (11-bit) identifier
pub const CAN_MSG_STD: u32 = 0x0002;
/// Extended (29-bit) identifier
pub const CAN_MSG_EXT: u32 = 0x0004;
/// Wake up message
pub const CAN_MSG_WAKEUP: u32 = 0x0008;
/// Transceiver reported NERR
pub const CAN_MSG_NERR: u32 = 0x0010;
/// Error frame
pub const CAN_MSG_ERROR_FRAME: u32 = 0x0020;
/// Transmit acknowledge (echo of an own frame)
pub const CAN_MSG_TXACK: u32 = 0x0040;
/// Transmit request
pub const CAN_MSG_TXRQ: u32 = 0x0080;
/// Hardware receive buffer overrun
pub const CAN_MSGERR_HW_OVERRUN: u32 = 0x0200;
/// Software receive buffer overrun
pub const CAN_MSGERR_SW_OVERRUN: u32 = 0x0400;

/// FD frame format
pub const CANFD_MSG_FDF: u32 = 0x01_0000;
/// Bit rate switch in the data phase
pub const CANFD_MSG_BRS: u32 = 0x02_0000;
/// Error state indicator
pub const CANFD_MSG_ESI: u32 = 0x04_0000;

// ============================================================================
// Status Flags (canSTAT_*)
// ============================================================================

/// Error passive
pub const CAN_STAT_ERROR_PASSIVE: u32 = 0x0000_0001;
/// Bus off
pub const CAN_STAT_BUS_OFF: u32 = 0x0000_0002;
/// Error warning
pub const CAN_STAT_ERROR_WARNING: u32 = 0x0000_0004;
/// Error active
pub const CAN_STAT_ERROR_ACTIVE: u32 = 0x0000_0008;
/// There are pending transmissions
pub const CAN_STAT_TX_PENDING: u32 = 0x0000_0010;
/// There are pending receptions
pub const CAN_STAT_RX_PENDING: u32 = 0x0000_0020;
/// Transmit error
pub const CAN_STAT_TXERR: u32 = 0x0000_0080;
/// Receive error
pub const CAN_STAT_RXERR: u32 = 0x0000_0100;
/// Hardware overrun
pub const CAN_STAT_HW_OVERRUN: u32 = 0x0000_0200;
/// Software overrun
pub const CAN_STAT_SW_OVERRUN: u32 = 0x0000_0400;

// ============================================================================
// Open Flags (canOPEN_*)
// ============================================================================

/// Exclusive access
pub const CAN_OPEN_EXCLUSIVE: u32 = 0x0008;
/// Fail if the channel cannot send extended identifiers
pub const CAN_OPEN_REQUIRE_EXTENDED: u32 = 0x0010;
/// Allow opening a virtual channel
pub const CAN_OPEN_ACCEPT_VIRTUAL: u32 = 0x0020;
/// Open the channel in CAN FD mode
pub const CAN_OPEN_CAN_FD: u32 = 0x0400;

// ============================================================================
// Channel Data Items (canCHANNELDATA_*)
// ============================================================================

/// Channel capabilities, `u32`
pub const CAN_CHANNELDATA_CHANNEL_CAP: i32 = 1;
/// Card serial number, `u64`
pub const CAN_CHANNELDATA_CARD_SERIAL_NO: i32 = 7;
/// Device description, ASCII
pub const CAN_CHANNELDATA_DEVDESCR_ASCII: i32 = 26;

/// Channel supports extended identifiers
pub const CAN_CHANNEL_CAP_EXTENDED_CAN: u32 = 0x0000_0001;
/// Channel supports CAN FD
pub const CAN_CHANNEL_CAP_CAN_FD: u32 = 0x0008_0000;

// ============================================================================
// Notification Flags (canNOTIFY_*)
// ============================================================================

/// Notify on received frames
pub const CAN_NOTIFY_RX: u32 = 0x0001;
/// Notify on chip status changes
pub const CAN_NOTIFY_STATUS: u32 = 0x0020;

// ============================================================================
// CAN Limits
// ============================================================================

/// Maximum data length for classic CAN
pub const CAN_MAX_DLEN: usize = 8;
/// Maximum data length for CAN FD
pub const CANFD_MAX_DLEN: usize = 64;
/// Standard identifier mask
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Extended identifier mask
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// FD DLC code to data length
pub const CANFD_DLC_TO_LEN: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Returned by DLC encoding for lengths that have no code
pub const INVALID_DLC: u8 = 0xFF;

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// Kvaser vendor ID
pub const KVASER_VENDOR_ID: u16 = 0x0BFD;
/// Kvaser Leaf SemiPro HS
pub const KVASER_LEAF_SEMIPRO_HS_PRODUCT_ID: u16 = 0x000E;
/// Kvaser Leaf Pro HS v2
pub const KVASER_LEAF_PRO_HS_V2_PRODUCT_ID: u16 = 0x0107;
/// Kvaser Leaf Light v2
pub const KVASER_LEAF_LIGHT_V2_PRODUCT_ID: u16 = 0x0120;

/// IXXAT (HMS) vendor ID
pub const IXXAT_VENDOR_ID: u16 = 0x08D8;
/// IXXAT USB-to-CAN FD
pub const IXXAT_USB_TO_CAN_FD_PRODUCT_ID: u16 = 0x0014;

/// PEAK-System vendor ID
pub const PEAK_VENDOR_ID: u16 = 0x0C72;
/// PEAK PCAN-USB FD
pub const PEAK_USB_FD_PRODUCT_ID: u16 = 0x0012;
