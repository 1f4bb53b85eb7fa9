//! Best-effort queries about this machine and a remote peer: names, local
//! addresses, the default gateway, echo TTL sampling and a TTL-based OS guess.
//!
//! Nothing here returns an error. Failures degrade to [`UNKNOWN`] or `None`
//! so a probe can never fail the connect/send path that asked for it.

mod command;
pub mod gateway;
pub mod icmp;

pub use gateway::default_gateway_ipv4;
pub use icmp::probe_ttl;

use linxtap_core::{FingerprintResult, OsFamily};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::debug;

/// Sentinel returned by the string-valued lookups when nothing could be resolved.
pub const UNKNOWN: &str = "Unknown";

/// Default wait for a single echo reply.
pub const DEFAULT_TTL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Hostname of this machine, or [`UNKNOWN`].
pub fn local_hostname() -> String {
    match dns_lookup::get_hostname() {
        Ok(h) if !h.trim().is_empty() => h,
        Ok(_) => UNKNOWN.to_string(),
        Err(e) => {
            debug!(error = %e, "hostname lookup failed");
            UNKNOWN.to_string()
        }
    }
}

/// First non-loopback IPv4 address bound to the local hostname, or [`UNKNOWN`].
pub fn local_ipv4() -> String {
    let Ok(hostname) = dns_lookup::get_hostname() else {
        return UNKNOWN.to_string();
    };
    match dns_lookup::lookup_host(&hostname) {
        Ok(addrs) => first_routable_ipv4(&addrs)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        Err(e) => {
            debug!(host = %hostname, error = %e, "local address lookup failed");
            UNKNOWN.to_string()
        }
    }
}

fn first_routable_ipv4(addrs: &[IpAddr]) -> Option<Ipv4Addr> {
    addrs.iter().find_map(|a| match a {
        IpAddr::V4(v4) if !v4.is_loopback() => Some(*v4),
        _ => None,
    })
}

/// Source address the routing table would pick for internet-bound traffic.
///
/// Connecting a UDP socket only selects a route; no datagram is sent.
pub fn outbound_ipv4() -> Option<String> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    sock.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match sock.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_unspecified() && !v4.is_loopback() => Some(v4.to_string()),
        _ => None,
    }
}

/// True iff a default gateway is discoverable right now and equals `ip`.
pub fn is_gateway(ip: &str) -> bool {
    matches_gateway(default_gateway_ipv4().as_deref(), ip)
}

fn matches_gateway(gateway: Option<&str>, ip: &str) -> bool {
    gateway.is_some_and(|g| g == ip)
}

/// Bucket a received TTL into the OS family whose usual initial TTL
/// (64, 128 or 255) it most likely started from.
///
/// Hosts with non-default initial TTLs, or behind middleboxes that rewrite
/// TTL, are misclassified. This is a hint, not an identification.
pub fn classify_os(ttl: u32) -> OsFamily {
    match ttl {
        33..=64 => OsFamily::LinuxUnix,
        65..=128 => OsFamily::Windows,
        129..=255 => OsFamily::NetworkDevice,
        _ => OsFamily::Unknown,
    }
}

/// Resolve a literal or hostname to its first IPv4 address (best-effort).
pub fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    let addrs = (host, 0u16).to_socket_addrs().ok()?;
    addrs
        .map(|sa| sa.ip())
        .find_map(|ip| match ip { IpAddr::V4(v4) => Some(v4), IpAddr::V6(_) => None })
}

/// Signals a session fingerprints its peer through.
pub trait Probe: Send + Sync + 'static {
    /// TTL of one echo reply from `ip`, waiting at most `timeout`.
    fn ttl(&self, ip: &str, timeout: Duration) -> Option<u8>;

    fn default_gateway(&self) -> Option<String>;

    fn is_gateway(&self, ip: &str) -> bool {
        matches_gateway(self.default_gateway().as_deref(), ip)
    }

    fn fingerprint(&self, ip: &str, timeout: Duration) -> FingerprintResult {
        let ttl = self.ttl(ip, timeout);
        let os_family = ttl.map(|t| classify_os(u32::from(t))).unwrap_or_default();
        FingerprintResult { os_family, is_gateway: self.is_gateway(ip), ttl }
    }
}

/// [`Probe`] backed by the live network stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl Probe for SystemProbe {
    fn ttl(&self, ip: &str, timeout: Duration) -> Option<u8> {
        probe_ttl(ip, timeout)
    }

    fn default_gateway(&self) -> Option<String> {
        default_gateway_ipv4()
    }
}
