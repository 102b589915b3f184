//! Pulse-oximeter sample source.
//!
//! The device driver owns a background reader that overwrites a single
//! "latest sample" slot. The acquisition loop only ever performs a
//! non-blocking read of that slot, so under slow polling intermediate
//! samples are simply never seen.

use crate::config::DeviceConfig;
use crate::utils::{Clock, SystemClock};
use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use crossbeam::atomic::AtomicCell;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Pulse rate recorded when no sample has been observed.
pub const PULSE_RATE_SENTINEL: u16 = 0;

/// One decoded oximeter reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub timestamp: NaiveDateTime,
    pub pulse_rate: u16,
    pub spo2: u8,
    pub waveform: u8,
}

/// Single-writer/single-reader handoff of the newest sample.
///
/// Backed by a seqlock cell: the writer never waits on the reader and the
/// reader never blocks the writer.
#[derive(Debug, Clone, Default)]
pub struct LatestSample {
    slot: Arc<AtomicCell<Option<Sample>>>,
}

impl LatestSample {
    pub fn new() -> Self {
        LatestSample::default()
    }

    pub fn publish(&self, sample: Sample) {
        self.slot.store(Some(sample));
    }

    /// Newest sample, if any. Does not consume it.
    pub fn latest(&self) -> Option<Sample> {
        self.slot.load()
    }

    /// Forget the current sample, e.g. when the probe loses the finger.
    pub fn clear(&self) {
        self.slot.store(None);
    }
}

/// Lifecycle of a biosignal device: connect, start, poll, stop, disconnect.
#[allow(async_fn_in_trait)]
pub trait SampleSource {
    async fn connect(&mut self) -> Result<()>;
    async fn start_live_acquisition(&mut self) -> Result<()>;
    /// Non-blocking read of the newest decoded sample.
    fn get_latest_data(&self) -> Option<Sample>;
    async fn stop_live_acquisition(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}

/// Driver producing a synthetic photoplethysmogram at the configured rate.
pub struct SimulatedOximeter {
    port: String,
    baud_rate: u32,
    enabled: bool,
    sample_interval: Duration,
    clock: Arc<dyn Clock>,
    latest: LatestSample,
    connected: bool,
    reader: Option<JoinHandle<()>>,
}

impl SimulatedOximeter {
    pub fn new(cfg: &DeviceConfig) -> Self {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: &DeviceConfig, clock: Arc<dyn Clock>) -> Self {
        SimulatedOximeter {
            port: cfg.port.clone(),
            baud_rate: cfg.baud_rate,
            enabled: cfg.enabled,
            sample_interval: Duration::from_secs_f64(1.0 / cfg.sample_rate_hz),
            clock,
            latest: LatestSample::new(),
            connected: false,
            reader: None,
        }
    }

    #[allow(dead_code)]
    pub fn is_acquiring(&self) -> bool {
        self.reader.is_some()
    }

    #[allow(dead_code)]
    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl SampleSource for SimulatedOximeter {
    async fn connect(&mut self) -> Result<()> {
        if !self.enabled {
            return Err(anyhow!("device on {} is disabled in configuration", self.port));
        }
        tracing::info!("simulated oximeter standing in for {} ({} baud)", self.port, self.baud_rate);
        self.connected = true;
        Ok(())
    }

    async fn start_live_acquisition(&mut self) -> Result<()> {
        if !self.connected {
            return Err(anyhow!("start_live_acquisition called before connect"));
        }
        if self.reader.is_some() {
            return Ok(());
        }

        let latest = self.latest.clone();
        let clock = self.clock.clone();
        let interval = self.sample_interval;
        self.reader = Some(tokio::spawn(async move {
            run_synthetic_reader(latest, clock, interval).await;
        }));
        tracing::info!("live acquisition started ({:?} per sample)", interval);
        Ok(())
    }

    fn get_latest_data(&self) -> Option<Sample> {
        self.latest.latest()
    }

    async fn stop_live_acquisition(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
            tracing::info!("live acquisition stopped");
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.reader.is_some() {
            self.stop_live_acquisition().await?;
        }
        if self.connected {
            self.connected = false;
            self.latest.clear();
            tracing::info!("disconnected from {}", self.port);
        }
        Ok(())
    }
}

async fn run_synthetic_reader(latest: LatestSample, clock: Arc<dyn Clock>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut phase = 0.0_f64;
    // ~72 bpm
    let beat_hz = 1.2;
    let step = std::f64::consts::TAU * beat_hz * interval.as_secs_f64();

    loop {
        ticker.tick().await;
        let (pulse_rate, spo2, jitter) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(70..=75), rng.gen_range(96..=98), rng.gen_range(-3.0..3.0))
        };
        let wave = (63.5 + 55.0 * phase.sin() + jitter).clamp(0.0, 127.0);
        latest.publish(Sample {
            timestamp: clock.now(),
            pulse_rate,
            spo2,
            waveform: wave as u8,
        });
        phase = (phase + step) % std::f64::consts::TAU;
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::utils::testing::StepLog;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Hardware lifecycle flags, shared so tests can inspect them after the
    /// source has been moved into a recorder.
    #[derive(Debug, Default)]
    pub struct DeviceFlags {
        pub connected: AtomicBool,
        pub acquiring: AtomicBool,
        pub stopped: AtomicBool,
        pub disconnected: AtomicBool,
    }

    impl DeviceFlags {
        pub fn released(&self) -> bool {
            self.stopped.load(Ordering::SeqCst) && self.disconnected.load(Ordering::SeqCst)
        }
    }

    /// Replays a scripted sequence of polls; each entry answers one
    /// `get_latest_data` call, then the last answer repeats.
    pub struct ScriptedSource {
        script: std::sync::Mutex<VecDeque<Option<Sample>>>,
        last: std::sync::Mutex<Option<Sample>>,
        pub fail_connect: bool,
        pub flags: Arc<DeviceFlags>,
        pub steps: StepLog,
    }

    impl ScriptedSource {
        pub fn new(script: Vec<Option<Sample>>) -> Self {
            ScriptedSource {
                script: std::sync::Mutex::new(script.into()),
                last: std::sync::Mutex::new(None),
                fail_connect: false,
                flags: Arc::new(DeviceFlags::default()),
                steps: StepLog::default(),
            }
        }

        pub fn with_steps(mut self, steps: StepLog) -> Self {
            self.steps = steps;
            self
        }

        pub fn unreachable() -> Self {
            let mut source = ScriptedSource::new(Vec::new());
            source.fail_connect = true;
            source
        }
    }

    impl SampleSource for ScriptedSource {
        async fn connect(&mut self) -> Result<()> {
            if self.fail_connect {
                return Err(anyhow!("no such port"));
            }
            self.flags.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn start_live_acquisition(&mut self) -> Result<()> {
            self.flags.acquiring.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn get_latest_data(&self) -> Option<Sample> {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        }

        async fn stop_live_acquisition(&mut self) -> Result<()> {
            self.flags.stopped.store(true, Ordering::SeqCst);
            self.steps.push("stop device");
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.flags.disconnected.store(true, Ordering::SeqCst);
            self.steps.push("disconnect device");
            Ok(())
        }
    }

    pub fn sample_at(timestamp: NaiveDateTime, pulse_rate: u16) -> Sample {
        Sample { timestamp, pulse_rate, spo2: 97, waveform: 64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::testing::base_time;

    fn device_config(enabled: bool) -> DeviceConfig {
        DeviceConfig {
            enabled,
            simulate: true,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            sample_rate_hz: 100.0,
        }
    }

    #[test]
    fn test_latest_sample_overwrites_and_does_not_consume() {
        let slot = LatestSample::new();
        assert_eq!(slot.latest(), None);

        let first = testing::sample_at(base_time(), 70);
        let second = testing::sample_at(base_time(), 80);
        slot.publish(first);
        slot.publish(second);

        assert_eq!(slot.latest(), Some(second));
        assert_eq!(slot.latest(), Some(second));

        slot.clear();
        assert_eq!(slot.latest(), None);
    }

    #[tokio::test]
    async fn test_simulated_oximeter_lifecycle() {
        let mut device = SimulatedOximeter::new(&device_config(true));
        device.connect().await.unwrap();
        device.start_live_acquisition().await.unwrap();
        assert!(device.is_acquiring());

        let mut seen = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            seen = device.get_latest_data();
            if seen.is_some() {
                break;
            }
        }
        let sample = seen.expect("simulated device produced no sample");
        assert!((70..=75).contains(&sample.pulse_rate));
        assert!(sample.waveform <= 127);

        device.stop_live_acquisition().await.unwrap();
        device.disconnect().await.unwrap();
        assert!(!device.is_acquiring());
        assert!(!device.is_connected());
        assert_eq!(device.get_latest_data(), None);
    }

    #[tokio::test]
    async fn test_disabled_device_fails_to_connect() {
        let mut device = SimulatedOximeter::new(&device_config(false));
        assert!(device.connect().await.is_err());
        assert!(device.start_live_acquisition().await.is_err());
        // cleanup on a never-connected device is harmless
        device.stop_live_acquisition().await.unwrap();
        device.disconnect().await.unwrap();
    }
}
