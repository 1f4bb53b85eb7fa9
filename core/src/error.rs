use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("IP address and port are required")]
    MissingInput,
    #[error("Port must be a valid number (got {0:?})")]
    InvalidPort(String),
    #[error("Port must be between 1 and 65535 (got {0})")]
    PortOutOfRange(i64),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("port {0} is outside 1..=65535")]
    InvalidPort(u32),
    #[error("already connected; disconnect first")]
    AlreadyConnected,
    #[error("connection refused: {0}")]
    Refused(#[source] std::io::Error),
    #[error("connection failed: {0}")]
    Transport(#[source] std::io::Error),
}

impl ConnectError {
    /// Map a failed connect attempt to the refused/transport split.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectError::Refused(err),
            _ => ConnectError::Transport(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected to any device")]
    NotConnected,
    #[error("send failed: {0}")]
    Transport(#[source] std::io::Error),
}
