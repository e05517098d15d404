//! Configuration for the streaming server.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vbridge_core::{ContextConfig, RateTuning};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Session format and limits.
    pub video: VideoConfig,
    /// Session internals.
    pub session: SessionConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP address to send from (or receive on, with `--receive`).
    pub bind_addr: String,
    /// Address of the receiving client.
    pub remote_addr: String,
    /// Datagram size limit in bytes.
    pub mtu: usize,
}

/// Video configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Output format: "lossless", "png", "jpeg" or "delta".
    pub format: String,
    pub max_frame_rate: u32,
    /// Rate at which the pattern is rendered.
    pub render_frame_rate: f64,
    /// Bitrate floor in bits/second.
    pub min_bitrate: u32,
    /// Bitrate ceiling in bits/second; 0 lifts the limit.
    pub max_bitrate: u32,
    /// Size of the generated test pattern.
    pub width: u32,
    pub height: u32,
    /// Stop after this many seconds; 0 streams until interrupted.
    pub duration_secs: u64,
}

/// Session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub transport_timeout_ms: u64,
    pub max_transport_failures: u32,
    /// Smoothing factor for the latency average.
    pub latency_alpha: f64,
    pub bandwidth_window_ms: u64,
    /// Share of the measured bandwidth the bitrate may use.
    pub headroom: f64,
    /// Largest bitrate step up per frame, as a factor.
    pub max_increase: f64,
    pub recheck_interval_ms: u64,
    pub jpeg_quality: u8,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".into(),
            remote_addr: "127.0.0.1:7341".into(),
            mtu: vbridge_core::video::DEFAULT_MTU,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            format: "delta".into(),
            max_frame_rate: 30,
            render_frame_rate: 30.0,
            min_bitrate: 1_000_000,
            max_bitrate: 20_000_000,
            width: 640,
            height: 360,
            duration_secs: 0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let rate = RateTuning::default();
        let ctx = ContextConfig::default();
        Self {
            transport_timeout_ms: ctx.transport_timeout.as_millis() as u64,
            max_transport_failures: ctx.max_transport_failures,
            latency_alpha: rate.latency_alpha,
            bandwidth_window_ms: rate.bandwidth_window.as_millis() as u64,
            headroom: rate.headroom,
            max_increase: rate.max_increase,
            recheck_interval_ms: rate.recheck_interval.as_millis() as u64,
            jpeg_quality: ctx.jpeg_quality,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Session tunables for every context the server opens.
    pub fn to_context_config(&self) -> ContextConfig {
        let s = &self.session;
        ContextConfig {
            transport_timeout: Duration::from_millis(s.transport_timeout_ms.max(1)),
            max_transport_failures: s.max_transport_failures.max(1),
            rate: RateTuning {
                latency_alpha: s.latency_alpha.clamp(0.0, 1.0),
                bandwidth_window: Duration::from_millis(s.bandwidth_window_ms.max(1)),
                headroom: unit_fraction(s.headroom, RateTuning::default().headroom),
                max_increase: s.max_increase.max(1.0),
                recheck_interval: Duration::from_millis(s.recheck_interval_ms.max(1)),
            },
            jpeg_quality: s.jpeg_quality.clamp(1, 100),
        }
    }
}

/// `value` if it lies in `(0, 1]`, else `fallback`.
fn unit_fraction(value: f64, fallback: f64) -> f64 {
    if value > 0.0 && value <= 1.0 { value } else { fallback }
}

// ── Tests ────────────────────────────────────────────────────────
