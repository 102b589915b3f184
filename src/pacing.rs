//! Fixed-period scheduler.
//!
//! Each iteration is paced from its own start: the loop sleeps only the
//! residual of the period, and an overrunning iteration is followed
//! immediately by the next one without any catch-up burst.

use anyhow::Result;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// What the task wants after one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Stop,
}

#[derive(Debug)]
pub enum StopReason {
    /// Configured session duration elapsed.
    DurationReached,
    /// Stop signal raised from outside the loop (Ctrl+C, UI close).
    Interrupted,
    /// The task itself returned [`Tick::Stop`].
    Completed,
    /// The task returned an unrecoverable error.
    Failed(anyhow::Error),
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, StopReason::Failed(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::DurationReached => write!(f, "duration reached"),
            StopReason::Interrupted => write!(f, "interrupted"),
            StopReason::Completed => write!(f, "completed"),
            StopReason::Failed(e) => write!(f, "failed: {:#}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopStats {
    pub iterations: u64,
    /// Iterations whose work took at least one full period.
    pub overruns: u64,
    pub elapsed: Duration,
}

impl LoopStats {
    pub fn actual_rate_hz(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.iterations as f64 / secs
        } else {
            0.0
        }
    }
}

/// Unit of work driven by [`PacedLoop`].
///
/// `finalize` consumes the task, so it runs exactly once whichever way the
/// loop ends.
#[allow(async_fn_in_trait)]
pub trait PacedTask {
    type Output;

    async fn tick(&mut self) -> Result<Tick>;
    async fn finalize(self, reason: StopReason, stats: LoopStats) -> Self::Output;
}

/// Raises the stop flag observed by every [`StopSignal`] clone.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the stop flag is raised. Never resolves if every
    /// handle was dropped without stopping.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: std::sync::Arc::new(tx) }, StopSignal { rx })
}

pub struct PacedLoop {
    period: Duration,
    max_duration: Option<Duration>,
    stop: StopSignal,
}

impl PacedLoop {
    pub fn new(period: Duration, stop: StopSignal) -> Self {
        PacedLoop { period, max_duration: None, stop }
    }

    pub fn with_max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    pub async fn run<T: PacedTask>(mut self, mut task: T) -> T::Output {
        let started = Instant::now();
        let mut stats = LoopStats::default();

        let reason = loop {
            if self.stop.is_stopped() {
                break StopReason::Interrupted;
            }
            if let Some(limit) = self.max_duration {
                if started.elapsed() >= limit {
                    break StopReason::DurationReached;
                }
            }

            let iteration_start = Instant::now();
            match task.tick().await {
                Ok(Tick::Continue) => stats.iterations += 1,
                Ok(Tick::Stop) => {
                    stats.iterations += 1;
                    break StopReason::Completed;
                }
                Err(e) => break StopReason::Failed(e),
            }

            let elapsed = iteration_start.elapsed();
            match self.period.checked_sub(elapsed) {
                Some(residual) if !residual.is_zero() => {
                    tokio::select! {
                        _ = tokio::time::sleep(residual) => {}
                        _ = self.stop.stopped() => break StopReason::Interrupted,
                    }
                }
                _ => {
                    stats.overruns += 1;
                    tracing::debug!("iteration overran period: {:?} >= {:?}", elapsed, self.period);
                }
            }
        };

        stats.elapsed = started.elapsed();
        tracing::info!(
            "paced loop ended ({}) after {} iterations in {:.2}s",
            reason,
            stats.iterations,
            stats.elapsed.as_secs_f64()
        );
        task.finalize(reason, stats).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    const MS: Duration = Duration::from_millis(1);

    /// Records iteration start instants; work time per tick comes from `costs`.
    struct Probe {
        costs: Vec<Duration>,
        starts: Vec<Instant>,
        stop_after: Option<usize>,
        fail_at: Option<usize>,
        on_tick: Option<(usize, StopHandle)>,
    }

    impl Probe {
        fn with_costs(costs: Vec<Duration>) -> Self {
            Probe { costs, starts: Vec::new(), stop_after: None, fail_at: None, on_tick: None }
        }
    }

    struct Finished {
        reason: StopReason,
        stats: LoopStats,
        starts: Vec<Instant>,
    }

    impl PacedTask for Probe {
        type Output = Finished;

        async fn tick(&mut self) -> Result<Tick> {
            let n = self.starts.len();
            self.starts.push(Instant::now());
            if self.fail_at == Some(n) {
                return Err(anyhow!("camera unplugged"));
            }
            let cost = self.costs.get(n).copied().unwrap_or(Duration::ZERO);
            if !cost.is_zero() {
                tokio::time::sleep(cost).await;
            }
            if let Some((at, handle)) = &self.on_tick {
                if *at == n {
                    handle.stop();
                }
            }
            if self.stop_after == Some(n + 1) {
                return Ok(Tick::Stop);
            }
            Ok(Tick::Continue)
        }

        async fn finalize(self, reason: StopReason, stats: LoopStats) -> Finished {
            Finished { reason, stats, starts: self.starts }
        }
    }

    fn gaps(starts: &[Instant]) -> Vec<Duration> {
        starts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_is_max_of_work_and_target() {
        let costs = vec![10 * MS, 80 * MS, 50 * MS, 0 * MS, 120 * MS, 20 * MS, 0 * MS];
        let mut probe = Probe::with_costs(costs.clone());
        probe.stop_after = Some(costs.len());
        let (_handle, signal) = stop_signal();

        let done = PacedLoop::new(50 * MS, signal).run(probe).await;

        assert!(matches!(done.reason, StopReason::Completed));
        assert_eq!(done.stats.iterations, costs.len() as u64);
        for (gap, cost) in gaps(&done.starts).iter().zip(&costs) {
            let expected = (*cost).max(50 * MS);
            assert!(*gap >= expected, "gap {:?} shorter than {:?}", gap, expected);
            assert!(*gap <= expected + MS, "gap {:?} exceeds {:?}", gap, expected);
        }
        // 80ms, 50ms and 120ms iterations get no sleep
        assert_eq!(done.stats.overruns, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_does_not_cause_catch_up_burst() {
        let mut costs = vec![200 * MS];
        costs.extend(std::iter::repeat(Duration::ZERO).take(5));
        let mut probe = Probe::with_costs(costs);
        probe.stop_after = Some(6);
        let (_handle, signal) = stop_signal();

        let done = PacedLoop::new(50 * MS, signal).run(probe).await;

        let g = gaps(&done.starts);
        assert!(g[0] >= 200 * MS);
        for gap in &g[1..] {
            assert!(*gap >= 50 * MS, "burst iteration {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_duration() {
        let probe = Probe::with_costs(Vec::new());
        let (_handle, signal) = stop_signal();

        let done = PacedLoop::new(50 * MS, signal)
            .with_max_duration(Duration::from_secs(1))
            .run(probe)
            .await;

        assert!(matches!(done.reason, StopReason::DurationReached));
        assert_eq!(done.stats.iterations, 20);
        assert!((done.stats.actual_rate_hz() - 20.0).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_sleep_ends_loop_promptly() {
        let (handle, signal) = stop_signal();
        let mut probe = Probe::with_costs(vec![5 * MS; 10]);
        probe.on_tick = Some((3, handle));

        let done = PacedLoop::new(Duration::from_secs(10), signal).run(probe).await;

        assert!(matches!(done.reason, StopReason::Interrupted));
        assert_eq!(done.stats.iterations, 4);
        assert!(done.stats.elapsed < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_iteration() {
        let (handle, signal) = stop_signal();
        handle.stop();

        let done = PacedLoop::new(50 * MS, signal).run(Probe::with_costs(Vec::new())).await;

        assert!(matches!(done.reason, StopReason::Interrupted));
        assert!(done.starts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_error_finalizes_with_failure() {
        let mut probe = Probe::with_costs(Vec::new());
        probe.fail_at = Some(2);
        let (_handle, signal) = stop_signal();

        let done = PacedLoop::new(50 * MS, signal).run(probe).await;

        assert!(done.reason.is_failure());
        assert_eq!(done.stats.iterations, 2);
        assert!(done.reason.to_string().contains("camera unplugged"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_never_stops() {
        let (handle, signal) = stop_signal();
        drop(handle);
        let mut probe = Probe::with_costs(Vec::new());
        probe.stop_after = Some(3);

        let done = PacedLoop::new(50 * MS, signal).run(probe).await;
        assert!(matches!(done.reason, StopReason::Completed));
    }
}
