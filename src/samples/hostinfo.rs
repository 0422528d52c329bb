//! Information about the host this process runs on.

use std::env;
use std::fs;
use std::net::UdpSocket;
use std::time::Instant;

use lazy_static::lazy_static;

use serde::{Deserialize, Serialize};

lazy_static! {
    /// Process start reference for uptime; pinned by the first `HostInfo`.
    static ref START: Instant = Instant::now();
}

/// Host name, addresses, and process uptime.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    host_name: String,
    ip_addresses: Vec<String>,
}

impl HostInfo {
    /// Gathers host information. Never fails; unknown parts fall back to
    /// placeholders.
    pub fn collect(me: &str) -> Self {
        lazy_static::initialize(&START);
        let info = HostInfo {
            host_name: Self::probe_host_name(),
            ip_addresses: Self::probe_ip_addresses(),
        };
        pf_info!(me; "host info: name '{}' addrs {:?}",
                     info.host_name, info.ip_addresses);
        info
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn ip_addresses(&self) -> &[String] {
        &self.ip_addresses
    }

    /// Milliseconds since host info was first collected in this process.
    pub fn uptime_ms(&self) -> u64 {
        START.elapsed().as_millis() as u64
    }

    fn probe_host_name() -> String {
        if let Ok(name) = env::var("HOSTNAME") {
            if !name.trim().is_empty() {
                return name.trim().to_string();
            }
        }
        match fs::read_to_string("/etc/hostname") {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => "Host Name not specified".into(),
        }
    }

    /// Loopback plus the address of the interface routing outwards, found by
    /// connecting a UDP socket (which sends nothing).
    fn probe_ip_addresses() -> Vec<String> {
        let mut addrs = vec!["127.0.0.1".to_string()];
        let outward = UdpSocket::bind("0.0.0.0:0")
            .and_then(|sock| {
                sock.connect("10.255.255.255:1")?;
                sock.local_addr()
            })
            .map(|addr| addr.ip());
        if let Ok(ip) = outward {
            if !ip.is_unspecified() && !ip.is_loopback() {
                addrs.push(ip.to_string());
            }
        }
        addrs
    }
}

#[cfg(test)]
mod hostinfo_tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn collect_host_info() {
        let info = HostInfo::collect("h");
        assert!(!info.host_name().is_empty());
        assert_eq!(info.ip_addresses()[0], "127.0.0.1");
        let up = info.uptime_ms();
        thread::sleep(Duration::from_millis(20));
        assert!(info.uptime_ms() >= up + 20);
    }
}
