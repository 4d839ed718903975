use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolMismatchError;

/// Service type the producer advertises under.
pub const SERVICE_TYPE: &str = "_camerastream._tcp";
/// Instance name the producer advertises by default.
pub const SERVICE_NAME: &str = "CameraStream";
/// Wire protocol version, published in the `version` TXT key.
pub const PROTOCOL_VERSION: &str = "1";

/// TXT key: wire protocol version.
pub const TXT_VERSION: &str = "version";
/// TXT key: sample grid as `WxHxC`.
pub const TXT_GRID: &str = "grid";
/// TXT key: wire framing.
pub const TXT_FRAMING: &str = "framing";

/// Normalise a DNS-SD service type to the fully qualified mDNS form.
///
/// `_camerastream._tcp` and `_camerastream._tcp.local` both become
/// `_camerastream._tcp.local.`.
pub fn normalize_service_type(service_type: &str) -> String {
    let trimmed = service_type.trim().trim_end_matches('.');
    if trimmed.ends_with(".local") {
        format!("{trimmed}.")
    } else {
        format!("{trimmed}.local.")
    }
}

/// True when two service type strings name the same DNS-SD type.
pub fn service_type_matches(expected: &str, actual: &str) -> bool {
    normalize_service_type(expected).eq_ignore_ascii_case(&normalize_service_type(actual))
}

// MARK: - ServiceAdvertisement

/// A (name, type, port) tuple the producer publishes on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAdvertisement {
    pub name: String,
    pub service_type: String,
    pub port: u16,
    /// TXT record entries published alongside the service.
    #[serde(default)]
    pub txt: BTreeMap<String, String>,
}

impl ServiceAdvertisement {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            port,
            txt: BTreeMap::new(),
        }
    }

    pub fn with_txt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.txt.insert(key.into(), value.into());
        self
    }

    /// TXT entries every CameraStream producer publishes.
    pub fn with_stream_txt(self, grid: FrameFormat, framing: Framing) -> Self {
        self.with_txt(TXT_VERSION, PROTOCOL_VERSION)
            .with_txt(TXT_GRID, grid.to_string())
            .with_txt(TXT_FRAMING, framing.to_string())
    }
}

// MARK: - RawAdvertisement

/// An advertisement as seen by a browser, before it has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAdvertisement {
    /// Instance name, e.g. `CameraStream`.
    pub name: String,
    pub service_type: String,
    /// Fully qualified instance name, e.g. `CameraStream._camerastream._tcp.local.`.
    pub fullname: String,
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// Frame grid published in the TXT record (`WxHxC`), if any.
    pub grid: Option<String>,
}

impl RawAdvertisement {
    /// Instance name from a fully qualified DNS-SD name.
    pub fn instance_from_fullname<'a>(fullname: &'a str, service_type: &str) -> &'a str {
        let ty = normalize_service_type(service_type);
        fullname
            .strip_suffix(ty.as_str())
            .map(|s| s.trim_end_matches('.'))
            .unwrap_or(fullname)
    }
}

// MARK: - ResolvedEndpoint

/// A connectable address for a discovered producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl ResolvedEndpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl std::fmt::Display for ResolvedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' at {}", self.name, self.socket_addr())
    }
}

// MARK: - ServiceEvent

/// Browse output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Found(RawAdvertisement),
    Lost { name: String, service_type: String },
}

impl ServiceEvent {
    pub fn service_type(&self) -> &str {
        match self {
            Self::Found(raw) => &raw.service_type,
            Self::Lost { service_type, .. } => service_type,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Found(raw) => &raw.name,
            Self::Lost { name, .. } => name,
        }
    }
}

// MARK: - NameMatch

/// How a consumer matches advertised instance names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameMatch {
    Exact,
    /// mDNS renames colliding instances to `CameraStream (2)`, so this is the default.
    #[default]
    Substring,
}

impl NameMatch {
    pub fn matches(&self, expected: &str, actual: &str) -> bool {
        match self {
            Self::Exact => expected == actual,
            Self::Substring => actual.contains(expected),
        }
    }
}

// MARK: - FrameFormat

/// Sample grid dimensions, agreed out of band by producer and consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl FrameFormat {
    /// 10×10 samples, one byte each.
    pub const REFERENCE: Self = Self { width: 10, height: 10, channels: 1 };

    pub fn new(width: u32, height: u32, channels: u8) -> Self {
        Self { width, height, channels }
    }

    pub fn samples(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes per frame on the wire.
    pub fn frame_len(&self) -> usize {
        self.samples() * self.channels as usize
    }

    /// Parse the `WxHxC` form used in TXT records.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('x');
        let width = parts.next()?.parse().ok()?;
        let height = parts.next()?.parse().ok()?;
        let channels = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { width, height, channels })
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::REFERENCE
    }
}

impl std::fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

// MARK: - Frame

/// One sampled grid, ready for the wire. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    format: FrameFormat,
    data: Bytes,
}

impl Frame {
    pub fn new(format: FrameFormat, data: impl Into<Bytes>) -> Result<Self, ProtocolMismatchError> {
        let data = data.into();
        if data.len() != format.frame_len() {
            return Err(ProtocolMismatchError::WrongLength {
                expected: format.frame_len(),
                got: data.len(),
            });
        }
        Ok(Self { format, data })
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Sample at grid position (x, y), all channels.
    pub fn sample(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.format.width || y >= self.format.height {
            return None;
        }
        let c = self.format.channels as usize;
        let start = (y as usize * self.format.width as usize + x as usize) * c;
        self.data.get(start..start + c)
    }

    /// Mean over every byte in the frame.
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as u64).sum::<u64>() as f64 / self.data.len() as f64
    }
}

// MARK: - Framing / SampleMode

/// Wire framing for frames on the transport socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Fixed-size payload, no header.
    #[default]
    Raw,
    /// u32 big-endian length followed by the payload.
    LengthPrefixed,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::LengthPrefixed => write!(f, "length_prefixed"),
        }
    }
}

/// How the sampler reduces a camera image to the sample grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleMode {
    /// Nearest-neighbour over the whole image.
    #[default]
    Downsample,
    /// Top-left W×H block of pixels.
    Crop,
}

// MARK: - Session states

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Listening { port: u16 },
    Connected { port: u16, session_id: String, peer: SocketAddr },
    Closed,
}

impl ProducerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening { .. } => "listening",
            Self::Connected { .. } => "connected",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Discovering,
    Resolving { name: String },
    Connecting { endpoint: ResolvedEndpoint },
    Connected { endpoint: ResolvedEndpoint },
    Closed,
}

impl ConsumerState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Resolving { .. } => "resolving",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_normalisation() {
        assert_eq!(normalize_service_type("_camerastream._tcp"), "_camerastream._tcp.local.");
        assert_eq!(normalize_service_type("_camerastream._tcp.local"), "_camerastream._tcp.local.");
        assert_eq!(normalize_service_type("_camerastream._tcp.local."), "_camerastream._tcp.local.");
        assert!(service_type_matches(SERVICE_TYPE, "_camerastream._tcp.local."));
        assert!(!service_type_matches(SERVICE_TYPE, "_http._tcp.local."));
    }

    #[test]
    fn instance_name_from_fullname() {
        let name = RawAdvertisement::instance_from_fullname(
            "CameraStream._camerastream._tcp.local.",
            SERVICE_TYPE,
        );
        assert_eq!(name, "CameraStream");
    }

    #[test]
    fn name_matching() {
        assert!(NameMatch::Substring.matches("CameraStream", "CameraStream (2)"));
        assert!(!NameMatch::Exact.matches("CameraStream", "CameraStream (2)"));
        assert!(NameMatch::Exact.matches("CameraStream", "CameraStream"));
    }

    #[test]
    fn frame_format_parse_and_len() {
        assert_eq!(FrameFormat::REFERENCE.frame_len(), 100);
        assert_eq!(FrameFormat::parse("10x10x1"), Some(FrameFormat::REFERENCE));
        assert_eq!(FrameFormat::parse("4x3x3").map(|f| f.frame_len()), Some(36));
        assert_eq!(FrameFormat::parse("10x10"), None);
        assert_eq!(FrameFormat::parse("10x10x1x1"), None);
        assert_eq!(FrameFormat::REFERENCE.to_string(), "10x10x1");
    }

    #[test]
    fn frame_rejects_wrong_length() {
        let err = Frame::new(FrameFormat::REFERENCE, vec![0u8; 99]).unwrap_err();
        assert_eq!(err, ProtocolMismatchError::WrongLength { expected: 100, got: 99 });
    }

    #[test]
    fn frame_sample_lookup() {
        let fmt = FrameFormat::new(2, 2, 3);
        let frame = Frame::new(fmt, (0u8..12).collect::<Vec<_>>()).unwrap();
        assert_eq!(frame.sample(1, 0), Some(&[3u8, 4, 5][..]));
        assert_eq!(frame.sample(1, 1), Some(&[9u8, 10, 11][..]));
        assert_eq!(frame.sample(2, 0), None);
    }
}
