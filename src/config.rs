use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_enabled")]
    pub enabled: bool,
    /// Feed synthetic samples instead of reading `port`.
    #[serde(default)]
    pub simulate: bool,
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
}

fn default_device_enabled() -> bool {
    true
}

fn default_sample_rate() -> f64 {
    60.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    pub target_fps: f64,
    pub duration_secs: u64,
    pub width: u32,
    pub height: u32,
}

impl CaptureConfig {
    /// Pacing period derived from the target frame rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos((1e9 / self.target_fps).round() as u64)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub video_filename: String,
    pub csv_filename: String,
}

impl OutputConfig {
    pub fn video_path(&self) -> PathBuf {
        self.dir.join(&self.video_filename)
    }

    pub fn csv_path(&self) -> PathBuf {
        self.dir.join(&self.csv_filename)
    }
}

/// Longest live window accepted; a day of samples at 60 Hz.
pub const MAX_HORIZON_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub horizon_secs: u64,
    pub poll_interval_ms: u64,
    pub csv_path: PathBuf,
}

impl MonitorConfig {
    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.horizon_secs as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    pub monitor: MonitorConfig,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.capture.target_fps.is_finite() && self.capture.target_fps > 0.0) {
            anyhow::bail!("capture.target_fps must be positive, got {}", self.capture.target_fps);
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            anyhow::bail!(
                "capture resolution must be non-zero, got {}x{}",
                self.capture.width,
                self.capture.height
            );
        }
        if !(self.device.sample_rate_hz.is_finite() && self.device.sample_rate_hz > 0.0) {
            anyhow::bail!("device.sample_rate_hz must be positive");
        }
        if self.monitor.horizon_secs == 0 || self.monitor.horizon_secs > MAX_HORIZON_SECS {
            anyhow::bail!(
                "monitor.horizon_secs must be between 1 and {}, got {}",
                MAX_HORIZON_SECS,
                self.monitor.horizon_secs
            );
        }
        if self.monitor.poll_interval_ms == 0 {
            anyhow::bail!("monitor.poll_interval_ms must be non-zero");
        }
        Ok(())
    }
}
