//! A single TCP conversation: connect, fingerprint the peer once, exchange
//! messages with a bounded wait for replies, disconnect.
//!
//! Calls must be serialized by the caller; a `Session` is driven through
//! `&mut self` and holds at most one connection.

use host_probe::{Probe, SystemProbe, DEFAULT_TTL_TIMEOUT};
use linxtap_core::{
    ConnectError, Direction, Endpoint, ExchangeOutcome, FingerprintResult, MessageEvent, SendError, SessionState,
};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Extra time allowed on top of the TTL timeout for the gateway lookup.
const FINGERPRINT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a reply after each send.
    pub read_timeout: Duration,
    /// How long the echo probe may wait during connect.
    pub ttl_timeout: Duration,
    /// Largest reply captured per exchange.
    pub read_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig { read_timeout: Duration::from_millis(1000), ttl_timeout: DEFAULT_TTL_TIMEOUT, read_buffer: 4096 }
    }
}

/// Everything that lives exactly as long as the connection does.
struct Link {
    endpoint: Endpoint,
    peer: SocketAddr,
    stream: TcpStream,
    fingerprint: FingerprintResult,
}

pub struct Session<P: Probe = SystemProbe> {
    probe: Arc<P>,
    config: SessionConfig,
    state: SessionState,
    link: Option<Link>,
}

impl Session<SystemProbe> {
    pub fn new(config: SessionConfig) -> Self {
        Session::with_probe(SystemProbe, config)
    }
}

impl Default for Session<SystemProbe> {
    fn default() -> Self {
        Session::new(SessionConfig::default())
    }
}

impl<P: Probe> Session<P> {
    pub fn with_probe(probe: P, config: SessionConfig) -> Self {
        Session { probe: Arc::new(probe), config, state: SessionState::Disconnected, link: None }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.link.as_ref().map(|l| &l.endpoint)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().map(|l| l.peer)
    }

    /// Fingerprint taken when the current connection was opened.
    pub fn fingerprint(&self) -> Option<FingerprintResult> {
        self.link.as_ref().map(|l| l.fingerprint)
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Open a connection to `endpoint` and fingerprint the peer.
    ///
    /// The port is checked before any socket is created. There is no connect
    /// timeout beyond the platform's own. A failed echo probe still yields a
    /// successful connect with an `Unknown` OS family. Dropping the future
    /// before it resolves leaves the session `Disconnected`.
    pub async fn connect(&mut self, endpoint: Endpoint) -> Result<FingerprintResult, ConnectError> {
        let Some(port) = endpoint.valid_port() else {
            return Err(ConnectError::InvalidPort(endpoint.port));
        };
        if self.state == SessionState::Connected {
            return Err(ConnectError::AlreadyConnected);
        }

        let mut attempt = Attempt::begin(&mut self.state);
        info!(endpoint = %endpoint, "connecting");
        let stream = match TcpStream::connect((endpoint.address.as_str(), port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "connect failed");
                return Err(ConnectError::from_io(e));
            }
        };
        let peer = stream.peer_addr().map_err(ConnectError::Transport)?;

        let fingerprint = fingerprint_peer(Arc::clone(&self.probe), self.config.ttl_timeout, peer.ip()).await;
        info!(
            endpoint = %endpoint,
            os = %fingerprint.os_family,
            ttl = ?fingerprint.ttl,
            gateway = fingerprint.is_gateway,
            "connected"
        );
        self.link = Some(Link { endpoint, peer, stream, fingerprint });
        attempt.complete();
        Ok(fingerprint)
    }

    /// Close the connection if one is open. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            info!(endpoint = %link.endpoint, "disconnected");
        }
        self.state = SessionState::Disconnected;
    }

    /// Write all of `payload`, then wait up to the read timeout for a reply.
    ///
    /// A write failure, a reset, or the peer closing its side all leave the
    /// session `Disconnected`. No reply within the timeout is not an error.
    pub async fn send(&mut self, payload: &[u8]) -> Result<ExchangeOutcome, SendError> {
        if self.state != SessionState::Connected {
            return Err(SendError::NotConnected);
        }
        let Some(link) = self.link.as_mut() else {
            return Err(SendError::NotConnected);
        };

        let written = link.stream.write_all(payload).await;
        if let Err(e) = written {
            warn!(endpoint = %link.endpoint, error = %e, "write failed, dropping connection");
            self.disconnect();
            return Err(SendError::Transport(e));
        }
        debug!(endpoint = %link.endpoint, bytes = payload.len(), "sent");
        let mut events = vec![MessageEvent::now(Direction::Sent, payload.to_vec())];

        let mut buf = vec![0u8; self.config.read_buffer.max(1)];
        let mut broken = false;
        let read = timeout(self.config.read_timeout, link.stream.read(&mut buf)).await;
        let response = match read {
            Err(_) => None,
            Ok(Ok(0)) => {
                info!(endpoint = %link.endpoint, "peer closed the connection");
                broken = true;
                None
            }
            Ok(Ok(n)) => Some(buf[..n].to_vec()),
            Ok(Err(e)) => {
                debug!(endpoint = %link.endpoint, error = %e, "read after send failed");
                broken = is_broken(e.kind());
                None
            }
        };
        if broken {
            self.disconnect();
        }

        if let Some(reply) = &response {
            events.push(MessageEvent::now(Direction::Received, reply.clone()));
        }
        Ok(ExchangeOutcome { bytes_sent: payload.len(), response, events })
    }
}

/// Holds the session in `Connecting` for the length of one connect call.
/// Any exit other than [`Attempt::complete`], including the future being
/// dropped mid-await, puts the state back to `Disconnected`.
struct Attempt<'a> {
    state: &'a mut SessionState,
    done: bool,
}

impl<'a> Attempt<'a> {
    fn begin(state: &'a mut SessionState) -> Self {
        *state = SessionState::Connecting;
        Attempt { state, done: false }
    }

    fn complete(&mut self) {
        *self.state = SessionState::Connected;
        self.done = true;
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.done {
            *self.state = SessionState::Disconnected;
        }
    }
}

async fn fingerprint_peer<P: Probe>(probe: Arc<P>, limit: Duration, ip: IpAddr) -> FingerprintResult {
    let target = ip.to_string();
    let task = tokio::task::spawn_blocking(move || probe.fingerprint(&target, limit));
    match timeout(limit + FINGERPRINT_GRACE, task).await {
        Ok(Ok(fp)) => fp,
        Ok(Err(e)) => {
            warn!(error = %e, "fingerprint task failed");
            FingerprintResult::default()
        }
        Err(_) => {
            debug!(peer = %ip, "fingerprint did not finish in time");
            FingerprintResult::default()
        }
    }
}

fn is_broken(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use linxtap_core::OsFamily;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct FakeProbe {
        ttl: Option<u8>,
        gateway: Option<String>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Probe for FakeProbe {
        fn ttl(&self, _ip: &str, _timeout: Duration) -> Option<u8> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.ttl
        }
        fn default_gateway(&self) -> Option<String> {
            self.gateway.clone()
        }
    }

    fn quick() -> SessionConfig {
        SessionConfig { read_timeout: Duration::from_millis(200), ttl_timeout: Duration::from_millis(200), read_buffer: 1024 }
    }

    async fn listener() -> (TcpListener, u32) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        (l, u32::from(port))
    }

    #[tokio::test]
    async fn out_of_range_ports_are_rejected_before_io() {
        let probe = FakeProbe::default();
        let calls = probe.calls.clone();
        let mut s = Session::with_probe(probe, quick());
        for port in [0u32, 65536, 70000, u32::MAX] {
            // an address that would fail differently if it were dialled
            let err = s.connect(Endpoint::new("unreachable.invalid", port)).await.unwrap_err();
            assert!(matches!(err, ConnectError::InvalidPort(p) if p == port));
            assert_eq!(s.state(), SessionState::Disconnected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refused_port_leaves_session_disconnected() {
        let (l, port) = listener().await;
        drop(l);
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        let err = s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap_err();
        assert!(matches!(err, ConnectError::Refused(_)), "got {err:?}");
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(s.fingerprint().is_none());
    }

    #[tokio::test]
    async fn connect_stores_fingerprint() {
        let (l, port) = listener().await;
        let probe = FakeProbe { ttl: Some(120), gateway: Some("127.0.0.1".into()), ..Default::default() };
        let mut s = Session::with_probe(probe, quick());
        let fp = s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        let _accepted = l.accept().await.unwrap();

        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(fp.os_family, OsFamily::Windows);
        assert!(fp.is_gateway);
        assert_eq!(s.fingerprint(), Some(fp));
        assert_eq!(s.endpoint(), Some(&Endpoint::new("127.0.0.1", port)));
    }

    #[tokio::test]
    async fn failed_ttl_probe_still_connects() {
        let (l, port) = listener().await;
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        let fp = s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        let _accepted = l.accept().await.unwrap();
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(fp.os_family, OsFamily::Unknown);
        assert!(!fp.is_gateway);
        assert_eq!(fp.ttl, None);
    }

    #[tokio::test]
    async fn second_connect_is_caller_error() {
        let (l, port) = listener().await;
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        let _accepted = l.accept().await.unwrap();
        let err = s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap_err();
        assert!(matches!(err, ConnectError::AlreadyConnected));
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        s.disconnect();
        s.disconnect();
        assert_eq!(s.state(), SessionState::Disconnected);

        let (l, port) = listener().await;
        s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        let _accepted = l.accept().await.unwrap();
        s.disconnect();
        s.disconnect();
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(s.fingerprint().is_none());
        assert!(s.endpoint().is_none());
    }

    #[tokio::test]
    async fn send_without_connection() {
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        let err = s.send(b"ping").await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[tokio::test]
    async fn silent_peer_times_out_without_error() {
        let (l, port) = listener().await;
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        let (_peer, _) = l.accept().await.unwrap();

        let started = Instant::now();
        let out = s.send(b"ping").await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(out.bytes_sent, 4);
        assert_eq!(out.response, None);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].direction, Direction::Sent);
        assert!(elapsed >= Duration::from_millis(150), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn echo_peer_reply_is_captured() {
        let (l, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = l.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
            sock
        });
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();

        let out = s.send("héllo".as_bytes()).await.unwrap();
        assert_eq!(out.bytes_sent, "héllo".len());
        assert_eq!(out.response.as_deref(), Some("héllo".as_bytes()));
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[1].direction, Direction::Received);
        assert_eq!(out.events[1].text(), "héllo");
        let _sock = server.await.unwrap();
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn peer_reset_fails_send_and_drops_session() {
        let (l, port) = listener().await;
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        let (peer, _) = l.accept().await.unwrap();
        // zero linger turns the close into a reset
        peer.set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = s.send(b"anyone there?").await.unwrap_err();
        assert!(matches!(err, SendError::Transport(_)), "got {err:?}");
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(s.fingerprint().is_none());
        assert!(matches!(s.send(b"again").await, Err(SendError::NotConnected)));
    }

    #[tokio::test]
    async fn peer_close_drops_session() {
        let (l, port) = listener().await;
        let mut s = Session::with_probe(FakeProbe::default(), quick());
        s.connect(Endpoint::new("127.0.0.1", port)).await.unwrap();
        let (peer, _) = l.accept().await.unwrap();
        drop(peer);

        // After an orderly close the kernel may still accept one write;
        // either the write or the following read reports the breakage.
        match s.send(b"anyone there?").await {
            Ok(out) => assert_eq!(out.response, None),
            Err(e) => assert!(matches!(e, SendError::Transport(_))),
        }
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn abandoned_connect_returns_to_disconnected() {
        let (l, port) = listener().await;
        let probe = FakeProbe { ttl: Some(64), delay: Duration::from_millis(400), ..Default::default() };
        let mut s = Session::with_probe(probe, quick());

        let res = tokio::time::timeout(Duration::from_millis(100), s.connect(Endpoint::new("127.0.0.1", port))).await;
        assert!(res.is_err(), "connect should still be fingerprinting");
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(s.fingerprint().is_none());
        assert!(s.endpoint().is_none());
        drop(l);
    }
}
