//! Configuration files
//!
//! Two TOML files drive a run: the loop configuration (which patterns to run
//! and how fast) and the driver configuration (controller addresses and
//! per-nozzle calibration ranges). Both are validated once at startup; any
//! problem is a [`Error::Config`] and stops the process before anything is
//! spawned.

use crate::artnet::ARTNET_PORT;
use crate::error::{Error, Result};
use crate::frame::NOZZLE_COUNT;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Maximum number of concurrently running pattern workers
pub const MAX_PATTERNS: usize = 6;

/// Number of hardware controllers, each owning [`NOZZLES_PER_CONTROLLER`] nozzles
pub const CONTROLLER_COUNT: usize = 3;
pub const NOZZLES_PER_CONTROLLER: usize = NOZZLE_COUNT / CONTROLLER_COUNT;

/// Input channel that carries elapsed loop time instead of a sensor value
pub const TIME_CHANNEL: &str = "time";

fn default_frame_interval_ms() -> f64 {
    100.0
}

fn default_worker_timeout_ms() -> f64 {
    1000.0
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("nozzle_data.json")
}

fn default_driver_config() -> PathBuf {
    PathBuf::from("driver.toml")
}

fn default_channel() -> String {
    TIME_CHANNEL.to_string()
}

/// One pattern to run and the input channel that feeds it
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    #[serde(default = "default_channel")]
    pub channel: String,
}

/// Frame loop configuration (`patterns.toml`)
#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: f64,
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: f64,
    #[serde(default)]
    pub sensor_pipe: Option<PathBuf>,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_driver_config")]
    pub driver_config: PathBuf,
    #[serde(default)]
    pub patterns: Vec<PatternSpec>,
}

impl LoopConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: LoopConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        millis("frame_interval_ms", self.frame_interval_ms)?;
        millis("worker_timeout_ms", self.worker_timeout_ms)?;
        if self.patterns.is_empty() {
            return Err(Error::Config("No patterns configured".to_string()));
        }
        if self.patterns.len() > MAX_PATTERNS {
            warn!(
                "Configuration contains {} patterns, limiting to first {}",
                self.patterns.len(),
                MAX_PATTERNS
            );
            self.patterns.truncate(MAX_PATTERNS);
        }
        for (i, spec) in self.patterns.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(Error::Config(format!("Pattern {} has an empty name", i)));
            }
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        millis("frame_interval_ms", self.frame_interval_ms).unwrap_or(Duration::MAX)
    }

    pub fn worker_timeout(&self) -> Duration {
        millis("worker_timeout_ms", self.worker_timeout_ms).unwrap_or(Duration::MAX)
    }
}

/// A positive millisecond count that fits in a [`Duration`]
fn millis(key: &str, ms: f64) -> Result<Duration> {
    if !(ms.is_finite() && ms > 0.0) {
        return Err(Error::Config(format!(
            "{} must be a positive number, got {}",
            key, ms
        )));
    }
    Duration::try_from_secs_f64(ms / 1000.0)
        .map_err(|_| Error::Config(format!("{} is out of range, got {}", key, ms)))
}

#[derive(Debug, Deserialize)]
struct ControllerEntry {
    address: String,
}

#[derive(Debug, Deserialize)]
struct RawDriverConfig {
    controllers: Vec<ControllerEntry>,
    ranges: Vec<[f64; 2]>,
}

/// Controller endpoints plus per-nozzle calibration (`driver.toml`).
///
/// Controller `k` owns nozzles `[12·k, 12·k + 12)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub controllers: [SocketAddr; CONTROLLER_COUNT],
    /// `(low, high)` output range per nozzle
    pub ranges: [(f64, f64); NOZZLE_COUNT],
}

impl DriverConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawDriverConfig = toml::from_str(content)?;

        if raw.controllers.len() != CONTROLLER_COUNT {
            return Err(Error::Config(format!(
                "Configuration must contain exactly {} controllers, found {}",
                CONTROLLER_COUNT,
                raw.controllers.len()
            )));
        }
        if raw.ranges.len() != NOZZLE_COUNT {
            return Err(Error::Config(format!(
                "Configuration must contain exactly {} ranges, found {}",
                NOZZLE_COUNT,
                raw.ranges.len()
            )));
        }

        let mut controllers = [SocketAddr::from(([0, 0, 0, 0], ARTNET_PORT)); CONTROLLER_COUNT];
        for (i, entry) in raw.controllers.iter().enumerate() {
            controllers[i] = resolve_controller(&entry.address)
                .map_err(|e| Error::Config(format!("Controller {}: {}", i, e)))?;
        }

        let mut ranges = [(0.0, 0.0); NOZZLE_COUNT];
        for (i, [low, high]) in raw.ranges.iter().copied().enumerate() {
            if !low.is_finite() || !high.is_finite() {
                return Err(Error::Config(format!(
                    "Range {} must be a pair of finite numbers, got [{}, {}]",
                    i, low, high
                )));
            }
            ranges[i] = (low, high);
        }

        Ok(Self {
            controllers,
            ranges,
        })
    }
}

/// Resolve `host` or `host:port`; a bare host gets the standard Art-Net port
pub fn resolve_controller(address: &str) -> Result<SocketAddr> {
    let address = address.trim();
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, ARTNET_PORT));
    }
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let has_port = address
        .rsplit_once(':')
        .map_or(false, |(_, port)| port.parse::<u16>().is_ok());
    let resolved = if has_port {
        address.to_socket_addrs()
    } else {
        (address, ARTNET_PORT).to_socket_addrs()
    };

    resolved
        .map_err(|e| Error::Config(format!("cannot resolve '{}': {}", address, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("'{}' resolved to no address", address)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_toml(controllers: usize, ranges: usize) -> String {
        let mut out = String::new();
        for i in 0..controllers {
            out.push_str(&format!("[[controllers]]\naddress = \"10.0.0.{}\"\n", 10 + i));
        }
        let pairs: Vec<String> = (0..ranges).map(|_| "[0.0, 255.0]".to_string()).collect();
        format!("ranges = [{}]\n{}", pairs.join(", "), out)
    }

    #[test]
    fn test_loop_config_defaults() {
        let config = LoopConfig::parse(
            r#"
            [[patterns]]
            name = "sine_sweep"
            "#,
        )
        .unwrap();
        assert_eq!(config.frame_interval(), Duration::from_millis(100));
        assert_eq!(config.worker_timeout(), Duration::from_secs(1));
        assert_eq!(config.snapshot_path, PathBuf::from("nozzle_data.json"));
        assert_eq!(config.sensor_pipe, None);
        assert_eq!(config.patterns[0].channel, TIME_CHANNEL);
    }

    #[test]
    fn test_loop_config_truncates_to_six_patterns() {
        let mut content = String::from("frame_interval_ms = 50\n");
        for i in 0..8 {
            content.push_str(&format!(
                "[[patterns]]\nname = \"amplitude\"\nchannel = \"pot{}\"\n",
                i
            ));
        }
        let config = LoopConfig::parse(&content).unwrap();
        assert_eq!(config.patterns.len(), MAX_PATTERNS);
        assert_eq!(config.patterns[5].channel, "pot5");
        assert_eq!(config.frame_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_loop_config_rejects_bad_interval_and_empty_list() {
        let bad_interval = "frame_interval_ms = 0\n[[patterns]]\nname = \"amplitude\"\n";
        assert!(matches!(LoopConfig::parse(bad_interval), Err(Error::Config(_))));

        let negative = "frame_interval_ms = -5.0\n[[patterns]]\nname = \"amplitude\"\n";
        assert!(matches!(LoopConfig::parse(negative), Err(Error::Config(_))));

        assert!(matches!(LoopConfig::parse(""), Err(Error::Config(_))));
        assert!(matches!(LoopConfig::parse("patterns = 3"), Err(Error::Config(_))));
    }

    #[test]
    fn test_loop_config_rejects_durations_out_of_range() {
        let huge_interval = "frame_interval_ms = 1e300\n[[patterns]]\nname = \"amplitude\"\n";
        let err = LoopConfig::parse(huge_interval).unwrap_err();
        assert!(err.to_string().contains("frame_interval_ms is out of range"));

        let huge_timeout = "worker_timeout_ms = 1e300\n[[patterns]]\nname = \"amplitude\"\n";
        let err = LoopConfig::parse(huge_timeout).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("worker_timeout_ms"));
    }

    #[test]
    fn test_driver_config_parses() {
        let config = DriverConfig::parse(&driver_toml(3, 36)).unwrap();
        assert_eq!(config.controllers[0], "10.0.0.10:6454".parse().unwrap());
        assert_eq!(config.controllers[2], "10.0.0.12:6454".parse().unwrap());
        assert_eq!(config.ranges[35], (0.0, 255.0));
    }

    #[test]
    fn test_driver_config_shape_errors() {
        assert!(matches!(DriverConfig::parse(&driver_toml(2, 36)), Err(Error::Config(_))));
        assert!(matches!(DriverConfig::parse(&driver_toml(3, 35)), Err(Error::Config(_))));

        let bad_pair = driver_toml(3, 35).replace("ranges = [", "ranges = [[1.0], ");
        assert!(matches!(DriverConfig::parse(&bad_pair), Err(Error::Config(_))));
    }

    #[test]
    fn test_shipped_configs_parse() {
        let config = LoopConfig::parse(include_str!("../patterns.toml")).unwrap();
        assert_eq!(config.patterns.len(), 2);
        assert_eq!(config.sensor_pipe, Some(PathBuf::from("/tmp/adc_pipe_main")));

        let driver = DriverConfig::parse(include_str!("../driver.toml")).unwrap();
        assert_eq!(driver.controllers[1], "192.168.1.102:6454".parse().unwrap());
    }

    #[test]
    fn test_resolve_controller_forms() {
        assert_eq!(
            resolve_controller("192.168.1.20").unwrap(),
            "192.168.1.20:6454".parse().unwrap()
        );
        assert_eq!(
            resolve_controller("127.0.0.1:40000").unwrap(),
            "127.0.0.1:40000".parse().unwrap()
        );
        assert_eq!(resolve_controller("::1").unwrap(), "[::1]:6454".parse().unwrap());
        assert_eq!(resolve_controller("localhost:7000").unwrap().port(), 7000);
    }
}
