//! # Host Identity Utilities
//!
//! Helpers for sussing out who we are: the local host name, the set of
//! interface addresses used to recognise ourselves in route table records,
//! and the wall-clock timestamps stamped into route manager requests.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Get current timestamp as seconds since the Unix epoch.
///
/// If the system time is before the epoch (very rare), returns 0 to
/// provide a safe fallback rather than panicking.
pub fn current_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The short local host name (domain part trimmed).
pub(crate) fn local_host_name() -> Option<String> {
    let name = nix::unistd::gethostname().ok()?;
    let name = name.to_string_lossy().into_owned();
    let short = name.split('.').next().unwrap_or(&name).to_string();
    if short.is_empty() {
        None
    } else {
        Some(short)
    }
}

/// Enumerate interface addresses as `addr:port` strings.
///
/// The port is appended to every address because route table records name
/// endpoints as `host:port`; the self-filter compares whole tokens. When a
/// bind interface was pinned to a concrete address the list is constrained
/// to it.
pub(crate) fn interface_ips(port: u16, bind_if: &str) -> Vec<String> {
    if let Ok(ip) = bind_if.parse::<IpAddr>() {
        if !ip.is_unspecified() {
            return vec![format_addr(&ip, port)];
        }
    }

    let mut out = Vec::new();
    if let Ok(addrs) = nix::ifaddrs::getifaddrs() {
        for ifa in addrs {
            let ss = match ifa.address {
                Some(ss) => ss,
                None => continue,
            };
            if let Some(sin) = ss.as_sockaddr_in() {
                out.push(format_addr(&IpAddr::V4(sin.ip()), port));
            } else if let Some(sin6) = ss.as_sockaddr_in6() {
                out.push(format_addr(&IpAddr::V6(sin6.ip()), port));
            }
        }
    }
    debug!(count = out.len(), "interface address list built");
    out
}

/// Pick the address used as our source IP identity: the first entry that
/// is not a loopback address, else the first entry of any kind.
pub(crate) fn default_ip(ip_list: &[String]) -> Option<String> {
    ip_list
        .iter()
        .find(|a| !a.starts_with("127.") && !a.starts_with("[::1]"))
        .or_else(|| ip_list.first())
        .cloned()
}

fn format_addr(ip: &IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_sane() {
        // well past 2020, well before the heat death
        let ts = current_timestamp_secs();
        assert!(ts > 1_577_836_800);
    }

    #[test]
    fn pinned_bind_if_constrains_list() {
        let list = interface_ips(4560, "10.1.2.3");
        assert_eq!(list, vec!["10.1.2.3:4560".to_string()]);
    }

    #[test]
    fn unspecified_bind_if_enumerates() {
        let list = interface_ips(4560, "0.0.0.0");
        // loopback should be present on any sane test host
        assert!(list
            .iter()
            .any(|a| a.starts_with("127.") || a.starts_with("[::1]")));
        assert!(list.iter().all(|a| a.ends_with(":4560")));
    }

    #[test]
    fn default_ip_skips_loopback() {
        let list = vec!["127.0.0.1:1".to_string(), "10.0.0.5:1".to_string()];
        assert_eq!(default_ip(&list).unwrap(), "10.0.0.5:1");
        let only_lo = vec!["127.0.0.1:1".to_string()];
        assert_eq!(default_ip(&only_lo).unwrap(), "127.0.0.1:1");
    }
}
