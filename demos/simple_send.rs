//! Simple Send Example
//!
//! Opens a channel at 125 kbit/s, goes bus on and sends message 0x123 a
//! number of times.
//!
//! Usage: simple_send [channel] [repeat]

use std::env;
use std::thread;
use std::time::Duration;

use canlib_usb::{
    CanStatus, Config, Registry, CAN_BITRATE_125K, CAN_CHANNELDATA_DEVDESCR_ASCII,
    CAN_OPEN_EXCLUSIVE, CAN_OPEN_REQUIRE_EXTENDED,
};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {} (status {})", e, e.status().code());
        std::process::exit(1);
    }
}

fn run() -> canlib_usb::Result<()> {
    let mut args = env::args().skip(1);
    let channel: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(0);
    let repeat: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(1).max(1);

    let registry = Registry::new(Config::default());
    println!("Scanning for adapters...");
    let handles = registry.scan()?;
    if handles.is_empty() {
        println!("No supported adapter found");
        return Ok(());
    }
    println!("{} channel(s) attached", registry.number_of_channels());

    println!("Sending a message on channel {}", channel);
    let handle = registry.open_channel(channel, CAN_OPEN_EXCLUSIVE | CAN_OPEN_REQUIRE_EXTENDED)?;
    println!(
        "Opened {:?} ({})",
        registry.channel_data(handle, CAN_CHANNELDATA_DEVDESCR_ASCII)?,
        registry.backend_kind(handle)?
    );

    registry.set_bus_params(handle, CAN_BITRATE_125K, 10, 5, 1, 1, 0)?;
    registry.bus_on(handle)?;

    for _ in 0..repeat {
        let status = CanStatus::from_result(&registry.write(handle, 0x123, b"canusb!\0", 8, 0));
        if status != CanStatus::Ok {
            println!("write on channel {} failed: {:?}", channel, status);
            break;
        }
        thread::sleep(Duration::from_micros(100));
    }

    // Give the writer a moment to flush before going off bus
    thread::sleep(Duration::from_millis(50));
    println!("Pipe statistics: {:?}", registry.pipe_stats(handle)?);
    registry.bus_off(handle)?;
    registry.close(handle)?;
    Ok(())
}
