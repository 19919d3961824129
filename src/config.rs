//! Registry and device tunables

use std::time::Duration;

/// Tunables shared by the registry and every device it creates
///
/// ```
/// use canlib_usb::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_max_channels(2)
///     .with_response_timeout(Duration::from_millis(20));
/// assert_eq!(config.max_channels, 2);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of handles the registry hands out
    pub max_channels: usize,
    /// Capacity of each device's decoded CAN event buffer
    pub event_buffer_capacity: usize,
    /// Capacity of the outbound command queue (Kvaser and PEAK)
    pub command_buffer_capacity: usize,
    /// Capacity of the outbound message queue (IXXAT)
    pub ixxat_tx_buffer_capacity: usize,
    /// Bounded wait for a request/response round trip
    pub response_timeout: Duration,
    /// Timeout for synchronous control and bulk transfers
    pub usb_timeout: Duration,
    /// How often a pending bulk-in read wakes up to check for shutdown
    pub read_poll_interval: Duration,
    /// Attempts per IXXAT control request
    pub control_retries: u32,
    /// Delay after powering up an IXXAT adapter
    pub power_settle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_channels: 5,
            event_buffer_capacity: 1000,
            command_buffer_capacity: 1000,
            ixxat_tx_buffer_capacity: 512,
            response_timeout: Duration::from_millis(50),
            usb_timeout: Duration::from_millis(1000),
            read_poll_interval: Duration::from_millis(100),
            control_retries: 10,
            power_settle: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn with_event_buffer_capacity(mut self, capacity: usize) -> Self {
        self.event_buffer_capacity = capacity;
        self
    }

    pub fn with_command_buffer_capacity(mut self, capacity: usize) -> Self {
        self.command_buffer_capacity = capacity;
        self
    }

    pub fn with_ixxat_tx_buffer_capacity(mut self, capacity: usize) -> Self {
        self.ixxat_tx_buffer_capacity = capacity;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_usb_timeout(mut self, timeout: Duration) -> Self {
        self.usb_timeout = timeout;
        self
    }

    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = interval;
        self
    }

    pub fn with_control_retries(mut self, retries: u32) -> Self {
        self.control_retries = retries;
        self
    }

    pub fn with_power_settle(mut self, settle: Duration) -> Self {
        self.power_settle = settle;
        self
    }
}
