//! Configuration for rainloop-ap
//!
//! Everything comes from one optional TOML file:
//!
//! ```toml
//! [engine]
//! sources = ["/audio/rain.flac", "https://cdn.example.com/drizzle.mp3"]
//! overlap_duration = 5.0
//! fade_duration = 3.0
//!
//! [server]
//! port = 5750
//!
//! [logging]
//! level = "info"
//!
//! [audio]
//! device = "default"
//! ```
//!
//! Command-line arguments and environment variables override the file
//! (see `main.rs`). Missing tables and fields take built-in defaults.

use crate::backend::BackendPreference;
use crate::error::{Error, Result};
use crate::playback::scheduler::CrossfadeWindow;
use rainloop_common::FadeCurve;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 5750;

/// Environment variable overriding the HTTP port
pub const PORT_ENV_VAR: &str = "RAINLOOP_PORT";

/// Engine settings (`[engine]` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ordered locators: file paths or http(s) URLs
    pub sources: Vec<String>,
    /// Seconds the next recording overlaps the end of the current one
    pub overlap_duration: f64,
    /// Crossfade ramp length, `0 < fade <= overlap`
    pub fade_duration: f64,
    /// How far ahead of its start the next unit is bound and scheduled
    pub preload_lead: f64,
    /// Initial master volume (0.0-1.0)
    pub master_volume: f32,
    pub fade_curve: FadeCurve,
    pub pause_fade: f64,
    /// Clamped to `fade_duration`
    pub stop_fade: f64,
    /// Smoothing ramp for volume changes
    pub volume_ramp: f64,
    pub pool_size: usize,
    /// Gain steps per ramp on the coarse backend
    pub coarse_steps: u32,
    /// Element handles per asset on the coarse backend
    pub elements_per_asset: usize,
    /// Delay before retrying a rotation that could not start any unit;
    /// must be positive
    pub retry_delay: f64,
    pub tick_interval_ms: u64,
    pub backend: BackendPreference,
    pub autoplay: bool,
    pub autoplay_delay: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            overlap_duration: 5.0,
            fade_duration: 3.0,
            preload_lead: 0.5,
            master_volume: 0.7,
            fade_curve: FadeCurve::Linear,
            pause_fade: 1.0,
            stop_fade: 0.5,
            volume_ramp: 0.25,
            pool_size: 4,
            coarse_steps: 60,
            elements_per_asset: 3,
            retry_delay: 0.1,
            tick_interval_ms: 10,
            backend: BackendPreference::Auto,
            autoplay: true,
            autoplay_delay: 0.5,
        }
    }
}

impl EngineConfig {
    /// Reject settings the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(self.overlap_duration > 0.0) {
            return Err(Error::Config(format!(
                "overlap_duration must be positive (got {})",
                self.overlap_duration
            )));
        }
        if !(self.fade_duration > 0.0) {
            return Err(Error::Config(format!(
                "fade_duration must be positive (got {})",
                self.fade_duration
            )));
        }
        if self.fade_duration > self.overlap_duration {
            return Err(Error::Config(format!(
                "fade_duration ({}) must not exceed overlap_duration ({})",
                self.fade_duration, self.overlap_duration
            )));
        }
        if !(0.0..=1.0).contains(&self.master_volume) {
            return Err(Error::Config(format!(
                "master_volume must be within 0.0-1.0 (got {})",
                self.master_volume
            )));
        }
        if self.preload_lead < 0.0 || self.pause_fade < 0.0 || self.stop_fade < 0.0 {
            return Err(Error::Config(
                "preload_lead, pause_fade and stop_fade must not be negative".to_string(),
            ));
        }
        if self.volume_ramp < 0.0 {
            return Err(Error::Config("volume_ramp must not be negative".to_string()));
        }
        if self.retry_delay <= 0.0 || !self.retry_delay.is_finite() {
            return Err(Error::Config(format!(
                "retry_delay ({}) must be positive",
                self.retry_delay
            )));
        }
        if self.pool_size < 2 {
            return Err(Error::Config(format!(
                "pool_size must be at least 2 (got {})",
                self.pool_size
            )));
        }
        if self.coarse_steps < 30 {
            return Err(Error::Config(format!(
                "coarse_steps must be at least 30 (got {})",
                self.coarse_steps
            )));
        }
        if self.elements_per_asset < 2 {
            return Err(Error::Config(format!(
                "elements_per_asset must be at least 2 (got {})",
                self.elements_per_asset
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn window(&self) -> CrossfadeWindow {
        CrossfadeWindow {
            overlap: self.overlap_duration,
            fade: self.fade_duration,
            preload_lead: self.preload_lead,
        }
    }

    /// Stop fade, never longer than the crossfade
    pub fn effective_stop_fade(&self) -> f64 {
        self.stop_fade.min(self.fade_duration)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// `[server]` table
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP port; `None` falls back to [`DEFAULT_PORT`]
    pub port: Option<u16>,
}

/// `[logging]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `[audio]` table
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output device name; `None` uses the host default
    pub device: Option<String>,
    /// Preferred output sample rate
    pub sample_rate: Option<u32>,
}

/// Whole config file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub engine: EngineConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub audio: AudioConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_stop_fade(), 0.5);
        assert_eq!(config.tick_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_fade_longer_than_overlap_rejected() {
        let config = EngineConfig {
            overlap_duration: 2.0,
            fade_duration: 2.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_non_positive_durations_rejected() {
        for (overlap, fade) in [(0.0, 0.0), (2.0, 0.0), (-1.0, -2.0)] {
            let config = EngineConfig {
                overlap_duration: overlap,
                fade_duration: fade,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "overlap={} fade={}", overlap, fade);
        }
    }

    #[test]
    fn test_limits() {
        let cases = [
            EngineConfig { master_volume: 1.5, ..Default::default() },
            EngineConfig { pool_size: 1, ..Default::default() },
            EngineConfig { coarse_steps: 10, ..Default::default() },
            EngineConfig { elements_per_asset: 1, ..Default::default() },
            EngineConfig { volume_ramp: -0.1, ..Default::default() },
        ];
        for config in cases {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_retry_delay_must_be_positive() {
        for delay in [0.0, -0.1, f64::NAN] {
            let config = EngineConfig {
                retry_delay: delay,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(Error::Config(_))), "retry_delay={}", delay);
        }
        let config = EngineConfig {
            retry_delay: 0.001,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stop_fade_clamped() {
        let config = EngineConfig {
            overlap_duration: 2.0,
            fade_duration: 0.3,
            stop_fade: 0.5,
            ..Default::default()
        };
        assert_eq!(config.effective_stop_fade(), 0.3);
    }

    #[test]
    fn test_parse_file() {
        let toml_text = r#"
            [engine]
            sources = ["/audio/rain.flac"]
            overlap_duration = 2.0
            fade_duration = 1.5
            fade_curve = "s_curve"
            backend = "coarse"

            [server]
            port = 6000
        "#;
        let config: FileConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.engine.sources, vec!["/audio/rain.flac".to_string()]);
        assert_eq!(config.engine.fade_curve, FadeCurve::SCurve);
        assert_eq!(config.engine.backend, BackendPreference::Coarse);
        assert_eq!(config.engine.master_volume, 0.7);
        assert_eq!(config.server.port, Some(6000));
        assert_eq!(config.logging.level, "info");
        assert!(config.engine.validate().is_ok());
    }
}
