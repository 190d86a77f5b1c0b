//! Completion tracking for numbered, possibly reordered message streams.
//!
//! A stream is numbered `0..=last` and exactly one message carries the last
//! marker. [`SequenceWindow`] is the pure bookkeeping; [`SequenceTracker`]
//! adds an idle timer that reports a stalled stream once;
//! [`NestedSequenceTracker`] tracks a stream of such streams.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::lock;

/// Next expected sequence number, the last marker, and early arrivals.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceWindow {
    cur: u64,
    last: Option<u64>,
    pending: BTreeSet<u64>,
    complete: bool,
}

impl SequenceWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one delivery. Returns true once every number up to and
    /// including the last marker has been seen, and stays true afterwards.
    ///
    /// Panics if the stream is marked last twice with different numbers.
    pub fn observe(&mut self, seq: u64, is_last: bool) -> bool {
        if is_last {
            match self.last {
                Some(prev) => assert_eq!(
                    prev, seq,
                    "sequence stream marked last at {prev} and again at {seq}"
                ),
                None => self.last = Some(seq),
            }
        }
        if self.complete {
            return true;
        }
        if seq < self.cur {
            // Duplicate delivery.
            return false;
        }
        if seq > self.cur {
            self.pending.insert(seq);
            return false;
        }

        loop {
            let passed = self.cur;
            self.cur += 1;
            if self.last == Some(passed) {
                self.complete = true;
                self.pending.clear();
                return true;
            }
            if self.pending.first() == Some(&self.cur) {
                self.pending.remove(&self.cur);
                continue;
            }
            return false;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Next sequence number expected in order.
    pub fn next_expected(&self) -> u64 {
        self.cur
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

struct IdleTimeout {
    interval: Duration,
    on_timeout: TimeoutCallback,
}

struct TrackerState {
    window: SequenceWindow,
    last_observed: Instant,
    timer: Option<JoinHandle<()>>,
    fired: bool,
    generation: u64,
}

/// [`SequenceWindow`] behind a lock, with an optional idle timer.
///
/// The timer arms on the first observation after construction or `reset`,
/// ticks every `interval`, and invokes the callback at most once when no
/// observation happened for a full interval. Completion cancels it.
pub struct SequenceTracker {
    state: Arc<Mutex<TrackerState>>,
    idle: Option<IdleTimeout>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                window: SequenceWindow::new(),
                last_observed: Instant::now(),
                timer: None,
                fired: false,
                generation: 0,
            })),
            idle: None,
        }
    }

    pub fn with_idle_timeout<F>(interval: Duration, on_timeout: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut tracker = Self::new();
        if !interval.is_zero() {
            tracker.idle = Some(IdleTimeout {
                interval,
                on_timeout: Arc::new(on_timeout),
            });
        }
        tracker
    }

    pub fn observe(&self, seq: u64, is_last: bool) -> bool {
        let mut state = lock(&self.state);
        state.last_observed = Instant::now();
        let complete = state.window.observe(seq, is_last);
        if complete {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        } else if state.timer.is_none() && !state.fired {
            self.arm(&mut state);
        }
        complete
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.state).window.is_complete()
    }

    pub fn window(&self) -> SequenceWindow {
        lock(&self.state).window.clone()
    }

    /// Forget everything observed and cancel the idle timer.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.window.reset();
        state.fired = false;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    fn arm(&self, state: &mut TrackerState) {
        let Some(idle) = self.idle.as_ref() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime; sequence idle timer disabled");
            return;
        };
        let shared = Arc::clone(&self.state);
        let interval = idle.interval;
        let on_timeout = Arc::clone(&idle.on_timeout);
        let generation = state.generation;
        state.timer = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                {
                    let mut state = lock(&shared);
                    if state.generation != generation || state.window.is_complete() {
                        return;
                    }
                    if state.last_observed.elapsed() < interval {
                        continue;
                    }
                    state.fired = true;
                    state.timer = None;
                }
                on_timeout();
                return;
            }
        }));
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SequenceTracker {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).timer.take() {
            timer.abort();
        }
    }
}

/// Completion tracking for a stream of streams: outer index `k` counts only
/// once its inner stream and every inner stream before it are complete.
#[derive(Debug, Default)]
pub struct NestedSequenceTracker {
    outer: SequenceWindow,
    inner: BTreeMap<u64, SequenceWindow>,
}

impl NestedSequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(
        &mut self,
        outer_seq: u64,
        outer_is_last: bool,
        inner_seq: u64,
        inner_is_last: bool,
    ) -> bool {
        if outer_is_last {
            match self.outer.last() {
                Some(prev) => assert_eq!(
                    prev, outer_seq,
                    "outer stream marked last at {prev} and again at {outer_seq}"
                ),
                None => {
                    self.outer.last = Some(outer_seq);
                }
            }
        }
        if self.outer.is_complete() {
            return true;
        }
        if outer_seq < self.outer.next_expected() {
            return false;
        }

        let inner_done = self
            .inner
            .entry(outer_seq)
            .or_default()
            .observe(inner_seq, inner_is_last);
        if !inner_done || outer_seq != self.outer.next_expected() {
            return false;
        }

        loop {
            let cur = self.outer.next_expected();
            self.inner.remove(&cur);
            if self.outer.observe(cur, false) {
                self.inner.clear();
                return true;
            }
            let next = self.outer.next_expected();
            match self.inner.get(&next) {
                Some(window) if window.is_complete() => continue,
                _ => return false,
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outer.is_complete()
    }

    /// Next outer index expected to complete.
    pub fn next_outer(&self) -> u64 {
        self.outer.next_expected()
    }

    pub fn reset(&mut self) {
        self.outer.reset();
        self.inner.clear();
    }
}
