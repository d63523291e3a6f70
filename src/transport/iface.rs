//! Network interface resolution for the TCP data path.

use crate::error::{CollieError, Result};
use std::net::IpAddr;

/// Resolve the address of a named interface, preferring IPv4.
pub fn interface_ip(interface_name: &str) -> Result<IpAddr> {
    use nix::ifaddrs::getifaddrs;

    let addrs = getifaddrs().map_err(|e| {
        CollieError::configuration(format!("cannot list network interfaces: {e}"))
    })?;

    let mut v6 = None;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface_name {
            continue;
        }
        let Some(addr) = ifaddr.address else {
            continue;
        };
        if let Some(sockaddr) = addr.as_sockaddr_in() {
            return Ok(IpAddr::V4(sockaddr.ip()));
        }
        if v6.is_none() {
            v6 = addr.as_sockaddr_in6().map(|sockaddr| IpAddr::V6(sockaddr.ip()));
        }
    }

    v6.ok_or_else(|| {
        CollieError::configuration(format!(
            "no IP address found for interface '{interface_name}'"
        ))
    })
}
