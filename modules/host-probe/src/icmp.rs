//! Single ICMP echo used to read the TTL a remote host answers with.
//!
//! A raw socket is tried first. Raw sockets need privileges on most
//! systems, so when one cannot be opened the platform `ping` binary is run
//! instead and its TTL field is scraped. Either way the call returns by the
//! deadline.

use crate::command::run_until;
use crate::resolve_ipv4;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;

const ECHO_REQUEST: u8 = 8;
const ECHO_REPLY: u8 = 0;
const PAYLOAD: &[u8] = b"linxtap-ttl-probe";

static SEQUENCE: AtomicU16 = AtomicU16::new(1);

/// TTL of an echo reply from `ip`, or `None` on timeout, unreachable host,
/// missing privileges with no usable `ping`, or any other failure.
pub fn probe_ttl(ip: &str, timeout: Duration) -> Option<u8> {
    let Some(target) = resolve_ipv4(ip) else {
        debug!(host = ip, "ttl probe skipped: no IPv4 address");
        return None;
    };
    let deadline = Instant::now() + timeout;
    let ttl = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
        Ok(socket) => raw_echo(&socket, target, deadline),
        Err(e) => {
            debug!(error = %e, "raw icmp socket unavailable, falling back to ping");
            ping_command(target, deadline)
        }
    };
    debug!(host = %target, ttl = ?ttl, "ttl probe finished");
    ttl
}

fn raw_echo(socket: &Socket, target: Ipv4Addr, deadline: Instant) -> Option<u8> {
    let identifier = std::process::id() as u16;
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(identifier, sequence);
    let addr = SocketAddr::new(IpAddr::V4(target), 0);

    socket.set_write_timeout(Some(remaining(deadline)?)).ok()?;
    socket.send_to(&packet, &addr.into()).ok()?;

    // The raw socket sees every ICMP packet for this host, so keep reading
    // until our reply shows up or time runs out.
    let mut buf = [0u8; 1500];
    let mut reader = socket;
    loop {
        socket.set_read_timeout(Some(remaining(deadline)?)).ok()?;
        let n = reader.read(&mut buf).ok()?;
        if let Some(ttl) = parse_echo_reply(&buf[..n], target, identifier, sequence) {
            return Some(ttl);
        }
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
}

fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + PAYLOAD.len());
    packet.push(ECHO_REQUEST);
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(PAYLOAD);
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u32::from(*hi) << 8 | u32::from(*lo),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        };
        sum = sum.wrapping_add(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Extract the IP TTL from a raw IPv4 datagram if it is the echo reply we
/// are waiting for.
fn parse_echo_reply(datagram: &[u8], from: Ipv4Addr, identifier: u16, sequence: u16) -> Option<u8> {
    if datagram.len() < 20 || datagram[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(datagram[0] & 0x0f) * 4;
    if ihl < 20 || datagram.len() < ihl + 8 {
        return None;
    }
    let source = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
    if source != from {
        return None;
    }
    let icmp = &datagram[ihl..];
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    if icmp[0] != ECHO_REPLY || icmp[1] != 0 || id != identifier || seq != sequence {
        return None;
    }
    Some(datagram[8])
}

fn ping_command(target: Ipv4Addr, deadline: Instant) -> Option<u8> {
    let wait = remaining(deadline)?;
    let Some((_, out)) = run_until("ping", &ping_args(target, wait), deadline) else {
        debug!(host = %target, "ping did not finish before the deadline");
        return None;
    };
    parse_ping_ttl(&out)
}

fn ping_args(target: Ipv4Addr, wait: Duration) -> Vec<String> {
    let ms = wait.as_millis().max(1);
    let addr = target.to_string();
    if cfg!(target_os = "windows") {
        vec!["-n".into(), "1".into(), "-w".into(), ms.to_string(), addr]
    } else if cfg!(target_os = "macos") {
        vec!["-c".into(), "1".into(), "-W".into(), ms.to_string(), addr]
    } else {
        // iputils takes whole seconds
        let secs = ((ms + 999) / 1000).max(1);
        vec!["-c".into(), "1".into(), "-W".into(), secs.to_string(), addr]
    }
}

fn parse_ping_ttl(output: &str) -> Option<u8> {
    static TTL: OnceLock<Regex> = OnceLock::new();
    let re = TTL.get_or_init(|| Regex::new(r"(?i)\bttl[=:]\s*(\d{1,3})\b").expect("static regex"));
    re.captures(output)?.get(1)?.as_str().parse().ok()
}
