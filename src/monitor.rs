//! Live pulse monitor: rolling waveform and heart-rate windows feeding the
//! live view, with the retained heart-rate window saved on exit.

use crate::config::AppConfig;
use crate::device::{Sample, SampleSource};
use crate::oximeter::Oximeter;
use crate::pacing::{LoopStats, PacedLoop, PacedTask, StopReason, StopSignal, Tick};
use crate::recorder::TeardownError;
use crate::storage::{CsvLog, DurableSink, FrameRecord};
use crate::window::{cutoff_for, PushOutcome, TimeWindowBuffer, WindowEntry};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use tokio::sync::watch;

/// Waveform and heart-rate windows trimmed against one cutoff per tick, so
/// both series always cover the same time range.
#[derive(Debug, Clone)]
pub struct LiveWindows {
    horizon: Duration,
    waveform: TimeWindowBuffer<u8>,
    heart_rate: TimeWindowBuffer<u16>,
}

impl LiveWindows {
    pub fn new(horizon: Duration) -> Self {
        LiveWindows {
            horizon,
            waveform: TimeWindowBuffer::new(horizon),
            heart_rate: TimeWindowBuffer::new(horizon),
        }
    }

    /// Add one sample to both windows. Returns the cutoff applied, or `None`
    /// if the sample was older than what is already held.
    pub fn record(&mut self, sample: &Sample) -> Option<NaiveDateTime> {
        if self.waveform.append(sample.timestamp, sample.waveform) == PushOutcome::Rejected {
            return None;
        }
        self.heart_rate.append(sample.timestamp, sample.pulse_rate);

        let cutoff = cutoff_for(sample.timestamp, self.horizon);
        self.waveform.evict_before(cutoff);
        self.heart_rate.evict_before(cutoff);
        Some(cutoff)
    }

    pub fn waveform(&self) -> &TimeWindowBuffer<u8> {
        &self.waveform
    }

    pub fn heart_rate(&self) -> &TimeWindowBuffer<u16> {
        &self.heart_rate
    }

    pub fn heart_rate_records(&self) -> Vec<FrameRecord> {
        self.heart_rate
            .iter()
            .map(|e| FrameRecord { timestamp: e.timestamp, pulse_rate: e.value })
            .collect()
    }
}

/// What the live view draws on each repaint.
#[derive(Debug, Clone, Default)]
#[cfg_attr(not(feature = "ui"), allow(dead_code))]
pub struct LiveSnapshot {
    pub waveform: Vec<WindowEntry<u8>>,
    pub heart_rate: Vec<WindowEntry<u16>>,
    pub pulse_rate: Option<u16>,
    pub spo2: Option<u8>,
    /// Visible x-range: `(cutoff, latest sample)`.
    pub range: Option<(NaiveDateTime, NaiveDateTime)>,
}

#[derive(Debug)]
pub struct MonitorReport {
    pub reason: StopReason,
    pub stats: LoopStats,
    pub samples: u64,
    pub idle_polls: u64,
    pub log_rows: Option<usize>,
    pub teardown_errors: Vec<TeardownError>,
}

impl MonitorReport {
    pub fn log_summary(&self) {
        tracing::info!(
            "monitor stopped ({}): {} samples over {} polls, {} without new data",
            self.reason,
            self.samples,
            self.stats.iterations,
            self.idle_polls
        );
        for e in &self.teardown_errors {
            tracing::error!("teardown step '{}' failed: {:#}", e.step, e.error);
        }
    }
}

pub struct LiveMonitor<S> {
    source: S,
    windows: LiveWindows,
    last_seen: Option<NaiveDateTime>,
    samples: u64,
    idle_polls: u64,
    snapshots: watch::Sender<LiveSnapshot>,
    log: CsvLog,
}

impl<S: SampleSource> LiveMonitor<S> {
    pub fn new(source: S, horizon: Duration, snapshots: watch::Sender<LiveSnapshot>, log: CsvLog) -> Self {
        LiveMonitor {
            source,
            windows: LiveWindows::new(horizon),
            last_seen: None,
            samples: 0,
            idle_polls: 0,
            snapshots,
            log,
        }
    }

    fn publish(&self, sample: &Sample, cutoff: NaiveDateTime) {
        let snapshot = LiveSnapshot {
            waveform: self.windows.waveform().snapshot(),
            heart_rate: self.windows.heart_rate().snapshot(),
            pulse_rate: Some(sample.pulse_rate),
            spo2: Some(sample.spo2),
            range: Some((cutoff, sample.timestamp)),
        };
        // no receivers just means nobody is watching
        self.snapshots.send_replace(snapshot);
    }
}

impl<S: SampleSource> PacedTask for LiveMonitor<S> {
    type Output = MonitorReport;

    /// A poll without a new sample still uses up its period.
    async fn tick(&mut self) -> Result<Tick> {
        let sample = match self.source.get_latest_data() {
            Some(s) if self.last_seen != Some(s.timestamp) => s,
            _ => {
                self.idle_polls += 1;
                return Ok(Tick::Continue);
            }
        };
        self.last_seen = Some(sample.timestamp);

        match self.windows.record(&sample) {
            Some(cutoff) => {
                self.samples += 1;
                self.publish(&sample, cutoff);
            }
            None => self.idle_polls += 1,
        }
        Ok(Tick::Continue)
    }

    async fn finalize(mut self, reason: StopReason, stats: LoopStats) -> MonitorReport {
        let mut teardown_errors = Vec::new();
        if let Err(error) = self.source.stop_live_acquisition().await {
            teardown_errors.push(TeardownError { step: "stop device", error });
        }
        if let Err(error) = self.source.disconnect().await {
            teardown_errors.push(TeardownError { step: "disconnect device", error });
        }

        let log_rows = match self.log.flush(&self.windows.heart_rate_records()).await {
            Ok(rows) => Some(rows),
            Err(error) => {
                teardown_errors.push(TeardownError { step: "flush pulse log", error });
                None
            }
        };

        MonitorReport {
            reason,
            stats,
            samples: self.samples,
            idle_polls: self.idle_polls,
            log_rows,
            teardown_errors,
        }
    }
}

/// Poll the oximeter until `stop` is raised, publishing live snapshots.
pub async fn run_monitor(
    cfg: &AppConfig,
    stop: StopSignal,
    snapshots: watch::Sender<LiveSnapshot>,
) -> Result<MonitorReport> {
    let mut source = Oximeter::from_config(&cfg.device);
    let started = async {
        source.connect().await?;
        source.start_live_acquisition().await
    }
    .await;
    if let Err(e) = started {
        // nothing has been recorded yet; just release what was opened
        if let Err(cleanup) = source.disconnect().await {
            tracing::warn!("disconnect after failed init: {:#}", cleanup);
        }
        return Err(e).with_context(|| format!("starting pulse oximeter on {}", cfg.device.port));
    }

    let monitor = LiveMonitor::new(
        source,
        cfg.monitor.horizon(),
        snapshots,
        CsvLog::new(&cfg.monitor.csv_path),
    );
    tracing::info!(
        "monitoring {} every {}ms, {}s window",
        cfg.device.port,
        cfg.monitor.poll_interval_ms,
        cfg.monitor.horizon_secs
    );
    Ok(PacedLoop::new(cfg.monitor.poll_interval(), stop).run(monitor).await)
}
