use crate::config::AppConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pulse_recorder",
    version,
    about = "Record video synchronized with a CMS50D pulse oximeter, or watch the live pulse waveform"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML config file (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Serial port of the oximeter
    #[arg(long, global = true)]
    pub port: Option<String>,

    /// Run without the oximeter; every record carries pulse rate 0
    #[arg(long, global = true)]
    pub no_device: bool,

    /// Use a synthetic pulse signal instead of the serial device
    #[arg(long, global = true, conflicts_with = "no_device")]
    pub simulate: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture video and the pulse rate of every frame
    Record(RecordArgs),
    /// Plot the live waveform and keep a rolling heart-rate log
    Monitor(MonitorArgs),
    /// List serial ports and check the configured one
    Ports,
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Target frame rate
    #[arg(long)]
    pub fps: Option<f64>,

    /// Session length in seconds
    #[arg(long)]
    pub duration: Option<u64>,

    /// Directory receiving the video and the pulse log
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Visible window in seconds
    #[arg(long)]
    pub horizon: Option<u64>,

    /// Where the retained heart-rate window is saved on exit
    #[arg(long)]
    pub csv: Option<PathBuf>,
}

impl Cli {
    /// Load the config and apply command-line overrides.
    pub fn resolve_config(&self) -> anyhow::Result<AppConfig> {
        let mut cfg = match &self.config {
            Some(path) => AppConfig::load_from(path)?,
            None => AppConfig::load_default()?,
        };

        if let Some(port) = &self.port {
            cfg.device.port = port.clone();
        }
        if self.no_device {
            cfg.device.enabled = false;
        }
        if self.simulate {
            cfg.device.simulate = true;
        }

        match &self.command {
            Command::Record(args) => {
                if let Some(fps) = args.fps {
                    cfg.capture.target_fps = fps;
                }
                if let Some(duration) = args.duration {
                    cfg.capture.duration_secs = duration;
                }
                if let Some(dir) = &args.output_dir {
                    cfg.output.dir = dir.clone();
                }
            }
            Command::Monitor(args) => {
                if let Some(horizon) = args.horizon {
                    cfg.monitor.horizon_secs = horizon;
                }
                if let Some(csv) = &args.csv {
                    cfg.monitor.csv_path = csv.clone();
                }
            }
            Command::Ports => {}
        }

        cfg.validate()?;
        Ok(cfg)
    }
}
