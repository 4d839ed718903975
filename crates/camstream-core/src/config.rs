use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ConfigError;
use crate::types::{FrameFormat, Framing, NameMatch, SampleMode, SERVICE_NAME, SERVICE_TYPE};

/// Prefix of every environment override, e.g. `CAMSTREAM_CAPTURE_FPS`.
pub const ENV_PREFIX: &str = "CAMSTREAM_";

/// Configuração de descoberta e streaming, compartilhada por producer e consumer.
///
/// Both ends must agree on `grid` and `framing`; nothing on the wire
/// negotiates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraStreamConfig {
    #[serde(alias = "serviceName")]
    pub service_name: String,
    #[serde(alias = "serviceType")]
    pub service_type: String,
    #[serde(alias = "nameMatch")]
    pub name_match: NameMatch,
    #[serde(alias = "bindAddr")]
    pub bind_addr: IpAddr,
    pub grid: FrameFormat,
    pub framing: Framing,
    #[serde(alias = "sampleMode")]
    pub sample_mode: SampleMode,
    #[serde(alias = "captureFPS", alias = "captureFps")]
    pub capture_fps: u32,
    #[serde(alias = "resolveTimeoutMs")]
    pub resolve_timeout_ms: u64,
    #[serde(alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
    #[serde(alias = "registrationProbeMs")]
    pub registration_probe_ms: u64,
    #[serde(alias = "retryBackoffMs")]
    pub retry_backoff_ms: u64,
    /// Quanto tempo o consumer evita um anúncio que acabou de falhar.
    #[serde(alias = "retryCooldownMs")]
    pub retry_cooldown_ms: u64,
    /// Zero disables stall detection on the consumer.
    #[serde(alias = "stallTimeoutMs")]
    pub stall_timeout_ms: u64,
}

impl Default for CameraStreamConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_owned(),
            service_type: SERVICE_TYPE.to_owned(),
            name_match: NameMatch::Substring,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            grid: FrameFormat::REFERENCE,
            framing: Framing::Raw,
            sample_mode: SampleMode::Downsample,
            capture_fps: 30,
            resolve_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            registration_probe_ms: 1_500,
            retry_backoff_ms: 250,
            retry_cooldown_ms: 2_000,
            stall_timeout_ms: 0,
        }
    }
}

impl CameraStreamConfig {
    /// Defaults, then the optional JSON file, then `CAMSTREAM_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let cfg = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;
        debug!("Loaded config from {}", shown);
        Ok(cfg)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("SERVICE_NAME") {
            self.service_name = v;
        }
        if let Some(v) = get("SERVICE_TYPE") {
            self.service_type = v;
        }
        if let Some(v) = get("NAME_MATCH") {
            match v.to_ascii_lowercase().as_str() {
                "exact" => self.name_match = NameMatch::Exact,
                "substring" => self.name_match = NameMatch::Substring,
                other => warn!("Ignoring {ENV_PREFIX}NAME_MATCH={other}"),
            }
        }
        if let Some(v) = get("BIND_ADDR") {
            match v.parse() {
                Ok(addr) => self.bind_addr = addr,
                Err(_) => warn!("Ignoring {ENV_PREFIX}BIND_ADDR={v}"),
            }
        }
        if let Some(v) = get("GRID") {
            match FrameFormat::parse(&v) {
                Some(grid) => self.grid = grid,
                None => warn!("Ignoring {ENV_PREFIX}GRID={v} (expected WxHxC)"),
            }
        }
        if let Some(v) = get("FRAMING") {
            match v.to_ascii_lowercase().as_str() {
                "raw" => self.framing = Framing::Raw,
                "length_prefixed" => self.framing = Framing::LengthPrefixed,
                other => warn!("Ignoring {ENV_PREFIX}FRAMING={other}"),
            }
        }
        if let Some(v) = get("SAMPLE_MODE") {
            match v.to_ascii_lowercase().as_str() {
                "downsample" => self.sample_mode = SampleMode::Downsample,
                "crop" => self.sample_mode = SampleMode::Crop,
                other => warn!("Ignoring {ENV_PREFIX}SAMPLE_MODE={other}"),
            }
        }

        let parse_num = |name: &str, slot: &mut u64| {
            if let Some(v) = get(name) {
                match v.parse() {
                    Ok(n) => *slot = n,
                    Err(_) => warn!("Ignoring {ENV_PREFIX}{name}={v}"),
                }
            }
        };
        parse_num("RESOLVE_TIMEOUT_MS", &mut self.resolve_timeout_ms);
        parse_num("CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms);
        parse_num("REGISTRATION_PROBE_MS", &mut self.registration_probe_ms);
        parse_num("RETRY_BACKOFF_MS", &mut self.retry_backoff_ms);
        parse_num("RETRY_COOLDOWN_MS", &mut self.retry_cooldown_ms);
        parse_num("STALL_TIMEOUT_MS", &mut self.stall_timeout_ms);

        if let Some(v) = get("CAPTURE_FPS") {
            match v.parse() {
                Ok(fps) => self.capture_fps = fps,
                Err(_) => warn!("Ignoring {ENV_PREFIX}CAPTURE_FPS={v}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::invalid("service_name must not be empty"));
        }
        let ty = self.service_type.trim();
        if !ty.starts_with('_') || !(ty.contains("._tcp") || ty.contains("._udp")) {
            return Err(ConfigError::invalid(format!(
                "service_type '{}' is not a DNS-SD type like '_name._tcp'",
                self.service_type
            )));
        }
        if self.grid.width == 0 || self.grid.height == 0 {
            return Err(ConfigError::invalid(format!("grid {} has a zero dimension", self.grid)));
        }
        if !matches!(self.grid.channels, 1 | 3 | 4) {
            return Err(ConfigError::invalid(format!(
                "grid channels must be 1, 3 or 4 (got {})",
                self.grid.channels
            )));
        }
        if self.capture_fps == 0 || self.capture_fps > 240 {
            return Err(ConfigError::invalid(format!(
                "capture_fps must be in 1..=240 (got {})",
                self.capture_fps
            )));
        }
        if self.resolve_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid("timeouts must be non-zero"));
        }
        Ok(())
    }

    /// Intervalo entre capturas.
    pub fn capture_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.capture_fps.max(1) as u64)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn registration_probe(&self) -> Duration {
        Duration::from_millis(self.registration_probe_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_ms > 0).then(|| Duration::from_millis(self.stall_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "serviceName": "Kitchen",
            "grid": {"width": 8, "height": 6, "channels": 3},
            "captureFPS": 15,
            "resolveTimeoutMs": 2000,
            "framing": "length_prefixed"
        }"#;

        let cfg: CameraStreamConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.service_name, "Kitchen");
        assert_eq!(cfg.grid.frame_len(), 144);
        assert_eq!(cfg.capture_fps, 15);
        assert_eq!(cfg.resolve_timeout_ms, 2_000);
        assert_eq!(cfg.framing, Framing::LengthPrefixed);
        // untouched fields keep their defaults
        assert_eq!(cfg.service_type, SERVICE_TYPE);
    }

    #[test]
    fn deserializes_snake_case_fields() {
        let json = r#"{
            "service_name": "CameraStream",
            "name_match": "exact",
            "capture_fps": 60,
            "sample_mode": "crop"
        }"#;

        let cfg: CameraStreamConfig = serde_json::from_str(json).expect("valid snake_case config");
        assert_eq!(cfg.name_match, NameMatch::Exact);
        assert_eq!(cfg.capture_fps, 60);
        assert_eq!(cfg.sample_mode, SampleMode::Crop);
        assert_eq!(cfg.grid, FrameFormat::REFERENCE);
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("CAMSTREAM_GRID", "4x4x3"),
            ("CAMSTREAM_CAPTURE_FPS", "not-a-number"),
            ("CAMSTREAM_FRAMING", "length_prefixed"),
            ("CAMSTREAM_BIND_ADDR", "127.0.0.1"),
            ("CAMSTREAM_RETRY_COOLDOWN_MS", "500"),
        ]
        .into_iter()
        .collect();

        let mut cfg = CameraStreamConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.grid, FrameFormat::new(4, 4, 3));
        assert_eq!(cfg.capture_fps, 30);
        assert_eq!(cfg.framing, Framing::LengthPrefixed);
        assert_eq!(cfg.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cfg.retry_cooldown(), Duration::from_millis(500));
    }

    #[test]
    fn loads_from_a_json_file() {
        let path = std::env::temp_dir().join(format!("camstream-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"serviceName": "Garage", "retryCooldownMs": 750}"#).unwrap();

        let cfg = CameraStreamConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.service_name, "Garage");
        assert_eq!(cfg.retry_cooldown_ms, 750);

        let err = CameraStreamConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(CameraStreamConfig::default().validate().is_ok());

        let cfg = CameraStreamConfig { service_type: "camerastream".into(), ..Default::default() };
        assert!(cfg.validate().is_err());

        let cfg = CameraStreamConfig { grid: FrameFormat::new(10, 10, 2), ..Default::default() };
        assert!(cfg.validate().is_err());

        let cfg = CameraStreamConfig { capture_fps: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn capture_interval_from_fps() {
        let cfg = CameraStreamConfig { capture_fps: 50, ..Default::default() };
        assert_eq!(cfg.capture_interval(), Duration::from_millis(20));
        assert_eq!(cfg.stall_timeout(), None);
    }
}
