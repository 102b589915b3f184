use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

mod cli;
mod config;
mod dashboard;
mod device;
mod diagnostics;
mod monitor;
mod oximeter;
mod pacing;
mod recorder;
mod storage;
mod utils;
mod video;
mod window;

use cli::{Cli, Command};
use config::AppConfig;
use monitor::{LiveSnapshot, MonitorReport};
use pacing::{StopHandle, StopSignal};
use recorder::RecorderState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = cli.resolve_config()?;
    info!("Starting pulse_recorder");

    // Ctrl+C only raises the stop flag; the paced loop notices it at its
    // boundary and runs the full teardown before we return.
    let (stop_handle, stop) = pacing::stop_signal();
    let interrupt = {
        let handle = stop_handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted by user (Ctrl+C)");
                handle.stop();
            }
        })
    };

    match cli.command {
        Command::Ports => {
            if !diagnostics::report_serial_ports(&cfg.device.port, cfg.device.baud_rate) {
                anyhow::bail!("oximeter port {} is not available", cfg.device.port);
            }
        }
        Command::Record(_) => {
            if cfg.device.enabled
                && !cfg.device.simulate
                && !diagnostics::report_serial_ports(&cfg.device.port, cfg.device.baud_rate)
            {
                tracing::warn!(
                    "{} is not available; frames will be recorded with pulse rate 0",
                    cfg.device.port
                );
            }
            let state = Arc::new(RecorderState::new());
            let progress = spawn_progress_log(state.clone());
            let report = recorder::run_session(&cfg, stop, state).await;
            progress.abort();

            let report = report?;
            report.log_summary();
            if report.log_rows.is_some() {
                info!("Saved HR data to: {}", report.log_path.display());
            }
        }
        Command::Monitor(_) => {
            let report = run_monitor_mode(&cfg, stop_handle, stop).await?;
            report.log_summary();
            if report.log_rows.is_some() {
                info!("Saved HR data to: {}", cfg.monitor.csv_path.display());
            }
        }
    }

    interrupt.abort();
    Ok(())
}

fn spawn_progress_log(state: Arc<RecorderState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                "recorder: {} frames ({} without pulse reading)",
                state.frames_recorded(),
                state.sentinel_records()
            );
        }
    })
}

#[cfg(not(feature = "ui"))]
async fn run_monitor_mode(cfg: &AppConfig, stop_handle: StopHandle, stop: StopSignal) -> Result<MonitorReport> {
    let (tx, rx) = watch::channel(LiveSnapshot::default());
    let view = dashboard::run_headless_view(rx, stop.clone());
    let acquisition = async {
        let report = monitor::run_monitor(cfg, stop, tx).await;
        // release the view if acquisition ended on its own
        stop_handle.stop();
        report
    };

    let (report, ()) = tokio::join!(acquisition, view);
    report
}

#[cfg(feature = "ui")]
async fn run_monitor_mode(cfg: &AppConfig, stop_handle: StopHandle, stop: StopSignal) -> Result<MonitorReport> {
    let (tx, rx) = watch::channel(LiveSnapshot::default());

    // The window owns the main thread, so acquisition gets its own runtime.
    let worker_cfg = cfg.clone();
    let view_stop = stop.clone();
    let worker_stop = stop_handle.clone();
    let worker = std::thread::spawn(move || -> Result<MonitorReport> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let report = rt.block_on(monitor::run_monitor(&worker_cfg, stop, tx));
        // closes the window if acquisition ended on its own
        worker_stop.stop();
        report
    });

    let view = dashboard::run_live_view(rx, stop_handle, view_stop);
    let report = worker
        .join()
        .map_err(|_| anyhow::anyhow!("monitor thread panicked"))??;
    view?;
    Ok(report)
}
