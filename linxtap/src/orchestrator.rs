//! Turns user intents (connect, disconnect, send) into session calls and
//! keeps the running log a front end renders.

use host_probe::{Probe, SystemProbe};
use linxtap_core::{ConnectError, Endpoint, ExchangeOutcome, FingerprintResult, SendError, SessionState};
use session::{Session, SessionConfig};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    System,
    Sent,
    Response,
    Confirm,
    Error,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::System => "system",
            LogKind::Sent => "sent",
            LogKind::Response => "response",
            LogKind::Confirm => "confirm",
            LogKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: OffsetDateTime,
    pub kind: LogKind,
    pub text: String,
}

/// What a connect/disconnect intent resulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected { endpoint: Endpoint, fingerprint: FingerprintResult },
    Disconnected,
    Failed(String),
}

pub struct Orchestrator<P: Probe = SystemProbe> {
    session: Session<P>,
    log: Vec<LogEntry>,
    last_error: Option<String>,
    offset: UtcOffset,
}

impl Orchestrator<SystemProbe> {
    pub fn new(config: SessionConfig) -> Self {
        Orchestrator::with_session(Session::new(config))
    }
}

impl<P: Probe> Orchestrator<P> {
    pub fn with_session(session: Session<P>) -> Self {
        Orchestrator { session, log: Vec::new(), last_error: None, offset: UtcOffset::UTC }
    }

    /// Stamp log entries in `offset` instead of UTC. The local offset has to
    /// be read before any worker threads exist, so callers pass it in.
    pub fn with_offset(mut self, offset: UtcOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// One-line projection of the session state for a status bar.
    pub fn status_line(&self) -> String {
        match (self.session.state(), self.session.endpoint()) {
            (SessionState::Connected, Some(ep)) => format!("Connected to {ep}"),
            (SessionState::Connecting, _) => "Connecting...".to_string(),
            _ => self.last_error.clone().unwrap_or_else(|| "Not connected".to_string()),
        }
    }

    /// The connect button: disconnects when connected, connects otherwise.
    pub async fn toggle(&mut self, address: &str, port: &str) -> Notice {
        if self.session.is_connected() {
            self.disconnect()
        } else {
            self.connect(address, port).await
        }
    }

    pub async fn connect(&mut self, address: &str, port: &str) -> Notice {
        let endpoint = match Endpoint::parse(address, port) {
            Ok(ep) => ep,
            Err(e) => return self.fail(e.to_string()),
        };
        match self.session.connect(endpoint.clone()).await {
            Ok(fingerprint) => {
                self.last_error = None;
                self.push(LogKind::System, format!("Connected to {endpoint}"));
                let os = match fingerprint.ttl {
                    Some(ttl) => format!("Remote OS: {} (ttl {ttl})", fingerprint.os_family),
                    None => format!("Remote OS: {}", fingerprint.os_family),
                };
                self.push(LogKind::System, os);
                let role = if fingerprint.is_gateway { "Gateway (Router)" } else { "Network Device" };
                self.push(LogKind::System, format!("Device type: {role}"));
                Notice::Connected { endpoint, fingerprint }
            }
            Err(e @ ConnectError::Refused(_)) => self.fail(e.to_string()),
            Err(e) => self.fail(format!("Error: {e}")),
        }
    }

    pub fn disconnect(&mut self) -> Notice {
        if self.session.state() != SessionState::Disconnected {
            self.session.disconnect();
            self.push(LogKind::System, "Disconnected");
        }
        self.last_error = None;
        Notice::Disconnected
    }

    /// Send one line of UTF-8 text. Blank input is ignored and returns `None`.
    pub async fn send_text(&mut self, text: &str) -> Option<Result<ExchangeOutcome, SendError>> {
        let message = text.trim();
        if message.is_empty() {
            return None;
        }
        let result = self.session.send(message.as_bytes()).await;
        match &result {
            Ok(out) => {
                self.push(LogKind::Sent, format!("SENT: {message}"));
                self.push(LogKind::Confirm, format!("Sent {} bytes", out.bytes_sent));
                if let Some(reply) = &out.response {
                    self.push(LogKind::Response, format!("RESPONSE: {}", String::from_utf8_lossy(reply)));
                }
                if !self.session.is_connected() {
                    self.lost("Connection closed by peer");
                }
            }
            Err(SendError::NotConnected) => self.push(LogKind::Error, SendError::NotConnected.to_string()),
            Err(e) => {
                self.push(LogKind::Error, e.to_string());
                if !self.session.is_connected() {
                    self.lost("Connection lost");
                }
            }
        }
        Some(result)
    }

    fn lost(&mut self, why: &str) {
        self.last_error = Some(why.to_string());
        self.push(LogKind::Error, why);
    }

    fn fail(&mut self, message: String) -> Notice {
        self.push(LogKind::Error, message.clone());
        self.last_error = Some(message.clone());
        Notice::Failed(message)
    }

    fn push(&mut self, kind: LogKind, text: impl Into<String>) {
        let timestamp = OffsetDateTime::now_utc().to_offset(self.offset);
        self.log.push(LogEntry { timestamp, kind, text: text.into() });
    }
}
