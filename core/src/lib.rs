//! Core types shared by the probe, session and front-end crates.

pub mod error;

pub use error::{ConnectError, EndpointError, SendError};

use std::fmt;
use time::OffsetDateTime;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Remote address and port a session talks to.
///
/// The port is kept wide so that out-of-range values survive until
/// `Session::connect` rejects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u32,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u32) -> Self {
        Endpoint { address: address.into(), port }
    }

    /// Build an endpoint from raw user input (address and port text).
    pub fn parse(address: &str, port: &str) -> Result<Self, EndpointError> {
        let address = address.trim();
        let port = port.trim();
        if address.is_empty() || port.is_empty() {
            return Err(EndpointError::MissingInput);
        }
        let p: i64 = port.parse().map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
        if !(1..=65535).contains(&p) {
            return Err(EndpointError::PortOutOfRange(p));
        }
        Ok(Endpoint { address: address.to_string(), port: p as u32 })
    }

    /// The port as a socket port, if it is in `1..=65535`.
    pub fn valid_port(&self) -> Option<u16> {
        match u16::try_from(self.port) {
            Ok(0) | Err(_) => None,
            Ok(p) => Some(p),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Operating system family guessed from the TTL of an echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsFamily {
    #[default]
    Unknown,
    LinuxUnix,
    Windows,
    NetworkDevice,
}

impl OsFamily {
    pub fn label(self) -> &'static str {
        match self {
            OsFamily::Unknown => "Unknown",
            OsFamily::LinuxUnix => "Linux/Unix",
            OsFamily::Windows => "Windows",
            OsFamily::NetworkDevice => "Cisco/Network Device",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Passive characterization of the remote host, taken once per connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FingerprintResult {
    pub os_family: OsFamily,
    pub is_gateway: bool,
    /// Raw TTL the OS guess was derived from, when the echo probe succeeded.
    pub ttl: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub direction: Direction,
    pub payload: Vec<u8>,
    pub timestamp: OffsetDateTime,
}

impl MessageEvent {
    pub fn now(direction: Direction, payload: Vec<u8>) -> Self {
        MessageEvent { direction, payload, timestamp: OffsetDateTime::now_utc() }
    }

    /// Payload rendered as text, replacing invalid UTF-8 sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Result of one write followed by one bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub bytes_sent: usize,
    /// `None` when nothing arrived before the read timeout.
    pub response: Option<Vec<u8>>,
    pub events: Vec<MessageEvent>,
}
