use std::{
    net::{IpAddr, Ipv4Addr, TcpListener},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};

/// Get the elapsed system time since the Unix Epoch in Milliseconds
pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_millis() as u64
}

/// Best-effort detection of a routable local address. Falls back to loopback
/// when the host has no usable interface.
pub fn local_ip() -> IpAddr {
    local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
}

/// Find a free TCP port, starting at `start` and probing upward.
pub fn find_available_port(start: u16) -> Result<u16> {
    for port in start..=u16::MAX {
        if TcpListener::bind(("0.0.0.0", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(anyhow!("no available port at or above {}", start))
}
