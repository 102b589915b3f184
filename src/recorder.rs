use crate::config::AppConfig;
use crate::device::{SampleSource, PULSE_RATE_SENTINEL};
use crate::oximeter::Oximeter;
use crate::pacing::{LoopStats, PacedLoop, PacedTask, StopReason, StopSignal, Tick};
use crate::storage::{CsvLog, DurableSink, FrameRecord};
use crate::utils::{Clock, SystemClock};
use crate::video::{FrameAnnotator, FrameSink, FrameSource, TestPatternCamera, TimestampOverlay, Y4mWriter};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Recorder counters shared with observers such as the live view.
#[derive(Debug, Default)]
pub struct RecorderState {
    frames_recorded: AtomicU64,
    sentinel_records: AtomicU64,
}

impl RecorderState {
    pub fn new() -> Self {
        RecorderState::default()
    }

    fn record(&self, pulse_rate: u16) {
        self.frames_recorded.fetch_add(1, Ordering::Relaxed);
        if pulse_rate == PULSE_RATE_SENTINEL {
            self.sentinel_records.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn frames_recorded(&self) -> u64 {
        self.frames_recorded.load(Ordering::Acquire)
    }

    pub fn sentinel_records(&self) -> u64 {
        self.sentinel_records.load(Ordering::Acquire)
    }
}

/// A teardown step that failed. Later steps still ran.
#[derive(Debug)]
pub struct TeardownError {
    pub step: &'static str,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub struct SessionReport {
    pub reason: StopReason,
    pub stats: LoopStats,
    pub records: usize,
    pub sentinel_records: u64,
    pub degraded: bool,
    pub log_path: PathBuf,
    /// Rows written to the pulse log, `None` when the flush failed.
    pub log_rows: Option<usize>,
    pub teardown_errors: Vec<TeardownError>,
}

impl SessionReport {
    pub fn is_clean(&self) -> bool {
        !self.reason.is_failure() && self.teardown_errors.is_empty()
    }

    pub fn log_summary(&self) {
        tracing::info!(
            "Done. Captured {} frames in {:.2} seconds (actual FPS {:.2}), stop reason: {}",
            self.stats.iterations,
            self.stats.elapsed.as_secs_f64(),
            self.stats.actual_rate_hz(),
            self.reason
        );
        if self.degraded {
            tracing::warn!("pulse oximeter was unavailable; all {} records carry pulse rate 0", self.records);
        } else if self.sentinel_records > 0 {
            tracing::warn!("{} of {} records carry no pulse reading", self.sentinel_records, self.records);
        }
        for e in &self.teardown_errors {
            tracing::error!("teardown step '{}' failed: {:#}", e.step, e.error);
        }
    }
}

/// Connect and start a device, or fall back to sentinel-only recording.
pub async fn connect_device<S: SampleSource>(mut source: S) -> Option<S> {
    let started = async {
        source.connect().await.context("connect")?;
        source.start_live_acquisition().await.context("start live acquisition")
    }
    .await;

    match started {
        Ok(()) => {
            tracing::info!("PPG acquisition started");
            Some(source)
        }
        Err(e) => {
            tracing::warn!("failed to initialize pulse oximeter: {:#}; recording video only", e);
            if let Err(e) = source.disconnect().await {
                tracing::warn!("disconnect after failed init: {:#}", e);
            }
            None
        }
    }
}

/// Pairs every captured frame with the newest pulse reading.
pub struct DualStreamRecorder<S, C, W, L = CsvLog, A = TimestampOverlay> {
    source: Option<S>,
    camera: C,
    sink: W,
    annotator: A,
    clock: Arc<dyn Clock>,
    records: Vec<FrameRecord>,
    log: L,
    state: Arc<RecorderState>,
}

impl<S, C, W, L> DualStreamRecorder<S, C, W, L>
where
    S: SampleSource,
    C: FrameSource,
    W: FrameSink,
    L: DurableSink,
{
    /// `source` is `None` when the device could not be brought up.
    pub fn new(source: Option<S>, camera: C, sink: W, log: L) -> Self {
        DualStreamRecorder {
            source,
            camera,
            sink,
            annotator: TimestampOverlay,
            clock: Arc::new(SystemClock),
            records: Vec::new(),
            log,
            state: Arc::new(RecorderState::new()),
        }
    }
}

impl<S, C, W, L, A> DualStreamRecorder<S, C, W, L, A>
where
    S: SampleSource,
    C: FrameSource,
    W: FrameSink,
    L: DurableSink,
    A: FrameAnnotator,
{
    #[allow(dead_code)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[allow(dead_code)]
    pub fn with_annotator<B: FrameAnnotator>(self, annotator: B) -> DualStreamRecorder<S, C, W, L, B> {
        DualStreamRecorder {
            source: self.source,
            camera: self.camera,
            sink: self.sink,
            annotator,
            clock: self.clock,
            records: self.records,
            log: self.log,
            state: self.state,
        }
    }

    pub fn with_state(mut self, state: Arc<RecorderState>) -> Self {
        self.state = state;
        self
    }

    #[allow(dead_code)]
    pub fn state(&self) -> Arc<RecorderState> {
        self.state.clone()
    }

    /// Release hardware first, then persist, so a failing disk never keeps
    /// the serial port or camera held.
    async fn teardown(&mut self) -> (Option<usize>, Vec<TeardownError>) {
        let mut errors = Vec::new();

        if let Some(source) = self.source.as_mut() {
            if let Err(error) = source.stop_live_acquisition().await {
                errors.push(TeardownError { step: "stop device", error });
            }
            if let Err(error) = source.disconnect().await {
                errors.push(TeardownError { step: "disconnect device", error });
            }
        }
        if let Err(error) = self.camera.release().await {
            errors.push(TeardownError { step: "release camera", error });
        }
        if let Err(error) = self.sink.finish().await {
            errors.push(TeardownError { step: "finish video", error });
        }

        let rows = match self.log.flush(&self.records).await {
            Ok(rows) => Some(rows),
            Err(error) => {
                errors.push(TeardownError { step: "flush pulse log", error });
                None
            }
        };
        (rows, errors)
    }
}

impl<S, C, W, L, A> PacedTask for DualStreamRecorder<S, C, W, L, A>
where
    S: SampleSource,
    C: FrameSource,
    W: FrameSink,
    L: DurableSink,
    A: FrameAnnotator,
{
    type Output = SessionReport;

    async fn tick(&mut self) -> Result<Tick> {
        let mut frame = self.camera.read().await.context("frame capture failed")?;

        let now = self.clock.now();
        self.annotator.annotate(&mut frame, &now);

        let pulse_rate = self
            .source
            .as_ref()
            .and_then(|s| s.get_latest_data())
            .map(|s| s.pulse_rate)
            .unwrap_or(PULSE_RATE_SENTINEL);

        self.records.push(FrameRecord { timestamp: now, pulse_rate });
        self.state.record(pulse_rate);

        self.sink.write(&frame).await.context("writing video frame")?;
        Ok(Tick::Continue)
    }

    async fn finalize(mut self, reason: StopReason, stats: LoopStats) -> SessionReport {
        if let StopReason::Failed(e) = &reason {
            tracing::error!("recording stopped: {:#}", e);
        }
        let (log_rows, teardown_errors) = self.teardown().await;

        SessionReport {
            reason,
            stats,
            records: self.records.len(),
            sentinel_records: self.state.sentinel_records(),
            degraded: self.source.is_none(),
            log_path: self.log.location().to_path_buf(),
            log_rows,
            teardown_errors,
        }
    }
}

/// Record video and pulse rate until the configured duration elapses, the
/// camera fails, or `stop` is raised.
pub async fn run_session(
    cfg: &AppConfig,
    stop: StopSignal,
    state: Arc<RecorderState>,
) -> Result<SessionReport> {
    tokio::fs::create_dir_all(&cfg.output.dir)
        .await
        .with_context(|| format!("creating output directory {}", cfg.output.dir.display()))?;

    // Capture is opened before the device so a failure here leaves nothing held.
    let camera = TestPatternCamera::new(&cfg.capture);
    let sink = Y4mWriter::create(&cfg.output.video_path(), &cfg.capture).await?;
    let source = connect_device(Oximeter::from_config(&cfg.device)).await;

    let recorder = DualStreamRecorder::new(source, camera, sink, CsvLog::new(cfg.output.csv_path()))
        .with_state(state);
    tracing::info!(
        "recording at {} FPS for {}s into {}",
        cfg.capture.target_fps,
        cfg.capture.duration_secs,
        cfg.output.dir.display()
    );

    let report = PacedLoop::new(cfg.capture.frame_interval(), stop)
        .with_max_duration(cfg.capture.duration())
        .run(recorder)
        .await;
    Ok(report)
}
