use chrono::{Duration, NaiveDateTime};
use std::collections::VecDeque;

/// One timestamped value held by a [`TimeWindowBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry<T> {
    pub timestamp: NaiveDateTime,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Entry stored; `evicted` older entries were dropped by this push.
    Accepted { evicted: usize },
    /// Timestamp was older than the newest entry; buffer left untouched.
    Rejected,
}

/// Sliding window keeping every entry no older than `latest - horizon`.
///
/// Timestamps must be non-decreasing. A push older than the newest entry is
/// rejected rather than inserted, since device and wall clocks only move
/// forward; equal timestamps are kept side by side. Eviction pops from the
/// front, so each push costs O(1 + evicted).
#[derive(Debug, Clone)]
pub struct TimeWindowBuffer<T> {
    entries: VecDeque<WindowEntry<T>>,
    horizon: Duration,
}

impl<T> TimeWindowBuffer<T> {
    pub fn new(horizon: Duration) -> Self {
        TimeWindowBuffer { entries: VecDeque::new(), horizon }
    }

    /// Append and evict against this buffer's own newest timestamp.
    #[allow(dead_code)]
    pub fn push(&mut self, timestamp: NaiveDateTime, value: T) -> PushOutcome {
        if self.append(timestamp, value) == PushOutcome::Rejected {
            return PushOutcome::Rejected;
        }
        let evicted = self.evict_before(cutoff_for(timestamp, self.horizon));
        PushOutcome::Accepted { evicted }
    }

    /// Append without evicting. Callers that trim several windows against a
    /// shared cutoff follow this with [`evict_before`](Self::evict_before).
    pub fn append(&mut self, timestamp: NaiveDateTime, value: T) -> PushOutcome {
        if let Some(latest) = self.latest() {
            if timestamp < latest {
                tracing::debug!("rejecting out-of-order entry at {} (latest {})", timestamp, latest);
                return PushOutcome::Rejected;
            }
        }
        self.entries.push_back(WindowEntry { timestamp, value });
        PushOutcome::Accepted { evicted: 0 }
    }

    /// Drop every entry strictly older than `cutoff`. Returns the number dropped.
    pub fn evict_before(&mut self, cutoff: NaiveDateTime) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.entries.front() {
            if front.timestamp < cutoff {
                self.entries.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    pub fn latest(&self) -> Option<NaiveDateTime> {
        self.entries.back().map(|e| e.timestamp)
    }

    #[allow(dead_code)]
    pub fn oldest(&self) -> Option<NaiveDateTime> {
        self.entries.front().map(|e| e.timestamp)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowEntry<T>> {
        self.entries.iter()
    }
}

/// Oldest timestamp still inside `horizon` of `latest`. A horizon reaching
/// past the representable range keeps everything.
pub fn cutoff_for(latest: NaiveDateTime, horizon: Duration) -> NaiveDateTime {
    latest.checked_sub_signed(horizon).unwrap_or(NaiveDateTime::MIN)
}

impl<T: Clone> TimeWindowBuffer<T> {
    pub fn snapshot(&self) -> Vec<WindowEntry<T>> {
        self.entries.iter().cloned().collect()
    }
}
