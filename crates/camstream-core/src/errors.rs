use std::net::SocketAddr;

use thiserror::Error;

/// Umbrella error for anything the CameraStream core can fail with.
#[derive(Error, Debug)]
pub enum CameraStreamError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolMismatchError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// MARK: - Discovery

/// Advertising the producer on the local segment failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Service name '{name}' is already taken on the local network")]
    NameConflict { name: String },

    #[error("Discovery daemon unreachable: {0}")]
    DaemonUnavailable(String),

    #[error("An advertisement is already active for '{name}'")]
    AlreadyAdvertising { name: String },

    #[error("Registration rejected: {reason}")]
    Rejected { reason: String },
}

/// Turning a discovered advertisement into an endpoint failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Resolution of '{name}' timed out after {ms}ms")]
    Timeout { name: String, ms: u64 },

    #[error("Malformed advertisement '{name}': {reason}")]
    Malformed { name: String, reason: String },

    #[error("Resolution of '{name}' already in flight")]
    InFlight { name: String },

    #[error("Browsing failed: {0}")]
    BrowseFailed(String),
}

// MARK: - Transport

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Connect to {addr} timed out after {ms}ms")]
    ConnectTimeout { addr: SocketAddr, ms: u64 },

    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Connection reset by peer")]
    Reset,

    #[error("Socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Classify a socket I/O error; resets and broken pipes become [`ConnectionError::Reset`].
    pub fn from_io(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::Reset
            }
            _ => Self::Io(e),
        }
    }
}

/// Anything that can go wrong once a socket is open.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolMismatchError),
}

impl From<TransportError> for CameraStreamError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Connection(e) => Self::Connection(e),
            TransportError::Protocol(e) => Self::Protocol(e),
        }
    }
}

/// The byte stream no longer lines up with the agreed frame size.
///
/// The raw wire format has no framing marker; a mismatch only shows up as a
/// short read at EOF, a stalled read, or a bad length.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMismatchError {
    #[error("Frame has {got} bytes, expected {expected}")]
    WrongLength { expected: usize, got: usize },

    #[error("Stream ended mid-frame: got {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },

    #[error("No complete frame within {ms}ms ({got} of {expected} bytes buffered)")]
    Stalled { expected: usize, got: usize, ms: u64 },
}

// MARK: - Capture / config

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Image buffer too small: {got} bytes for {width}×{height} {format}")]
    ShortBuffer {
        width: u32,
        height: u32,
        format: String,
        got: usize,
    },

    #[error("Image {width}×{height} is smaller than the {grid} sample grid")]
    ImageTooSmall { width: u32, height: u32, grid: String },

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u8),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration invalid: {reason}")]
    Invalid { reason: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Error, ErrorKind};

    use super::*;

    #[test]
    fn resets_are_classified() {
        for kind in [ErrorKind::ConnectionReset, ErrorKind::ConnectionAborted, ErrorKind::BrokenPipe] {
            assert!(matches!(ConnectionError::from_io(Error::from(kind)), ConnectionError::Reset));
        }
        assert!(matches!(
            ConnectionError::from_io(Error::from(ErrorKind::TimedOut)),
            ConnectionError::Io(_)
        ));
    }

    #[test]
    fn transport_errors_flatten_into_the_umbrella() {
        let e: CameraStreamError = TransportError::from(ProtocolMismatchError::Truncated { expected: 100, got: 40 }).into();
        assert!(matches!(e, CameraStreamError::Protocol(ProtocolMismatchError::Truncated { got: 40, .. })));
        assert_eq!(e.to_string(), "Stream ended mid-frame: got 40 of 100 bytes");
    }
}
