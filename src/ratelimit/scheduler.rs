//! Recurring timers that drive window-open cycles.
//!
//! A [`Scheduler`] invokes a tick once a period has elapsed and then again on
//! every following period, until the returned [`TimerHandle`] is cancelled or
//! dropped. [`TokioScheduler`] backs this with a tokio task per timer;
//! [`ManualScheduler`] only moves when told to, which makes window behavior
//! testable without waiting on a clock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, trace};

use crate::error::{Result, SluiceError};

/// Callback invoked on every timer tick.
pub type Tick = Arc<dyn Fn() + Send + Sync + 'static>;

/// A source of recurring timers.
pub trait Scheduler: Send + Sync {
    /// Invoke `tick` after `period`, then again every `period`.
    fn schedule_repeating(&self, period: Duration, tick: Tick) -> Result<TimerHandle>;
}

/// Exclusive handle to a recurring timer. Dropping it cancels the timer.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    /// Wrap the routine that tears the timer down.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the timer. No tick starts after this returns.
    pub fn cancel(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

fn check_period(period: Duration) -> Result<()> {
    if period.is_zero() {
        return Err(SluiceError::SchedulerUnavailable(
            "timer period must be non-zero".to_string(),
        ));
    }
    Ok(())
}

/// Scheduler spawning one tokio task per timer.
///
/// A tick that panics is logged and the timer keeps running.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    handle: Option<Handle>,
}

impl TokioScheduler {
    /// Create a scheduler using whichever runtime is current when a timer
    /// is scheduled.
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Create a scheduler pinned to a specific runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, period: Duration, tick: Tick) -> Result<TimerHandle> {
        check_period(period)?;

        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => Handle::try_current()
                .map_err(|e| SluiceError::SchedulerUnavailable(e.to_string()))?,
        };

        let first = Instant::now() + period;
        let task = handle.spawn(async move {
            let mut interval = time::interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                trace!(period_ms = period.as_millis() as u64, "Timer tick");

                if panic::catch_unwind(AssertUnwindSafe(|| tick())).is_err() {
                    error!(
                        period_ms = period.as_millis() as u64,
                        "Timer tick panicked"
                    );
                }
            }
        });

        Ok(TimerHandle::new(move || task.abort()))
    }
}

struct ManualTimer {
    id: u64,
    period: Duration,
    until_next: Duration,
    tick: Tick,
}

#[derive(Default)]
struct ManualState {
    next_id: u64,
    timers: Vec<ManualTimer>,
}

/// Scheduler driven by explicit calls instead of a clock.
///
/// Ticks run on the thread calling [`ManualScheduler::advance`] or
/// [`ManualScheduler::fire`], with no internal lock held.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    /// Create a scheduler with no timers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers not yet cancelled.
    pub fn active_timers(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Move time forward by `elapsed`, running every tick that comes due,
    /// in the order they come due.
    pub fn advance(&self, elapsed: Duration) {
        let mut left = elapsed;

        loop {
            let due = {
                let mut state = self.inner.lock();
                let step = state.timers.iter().map(|t| t.until_next).min();

                match step {
                    Some(step) if step <= left => {
                        left -= step;
                        let mut due = Vec::new();
                        for timer in state.timers.iter_mut() {
                            timer.until_next -= step;
                            if timer.until_next.is_zero() {
                                timer.until_next = timer.period;
                                due.push((timer.id, Arc::clone(&timer.tick)));
                            }
                        }
                        due
                    }
                    _ => {
                        for timer in state.timers.iter_mut() {
                            timer.until_next -= left;
                        }
                        return;
                    }
                }
            };

            self.run(due);
        }
    }

    /// Run every active timer once, as if each had just reached a boundary.
    pub fn fire(&self) {
        let due: Vec<(u64, Tick)> = {
            let mut state = self.inner.lock();
            state
                .timers
                .iter_mut()
                .map(|timer| {
                    timer.until_next = timer.period;
                    (timer.id, Arc::clone(&timer.tick))
                })
                .collect()
        };

        self.run(due);
    }

    fn run(&self, due: Vec<(u64, Tick)>) {
        for (id, tick) in due {
            // an earlier tick in this batch may have cancelled this timer
            if self.is_active(id) {
                tick();
            }
        }
    }

    fn is_active(&self, id: u64) -> bool {
        self.inner.lock().timers.iter().any(|t| t.id == id)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, period: Duration, tick: Tick) -> Result<TimerHandle> {
        check_period(period)?;

        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.timers.push(ManualTimer {
                id,
                period,
                until_next: period,
                tick,
            });
            id
        };

        let inner: Weak<Mutex<ManualState>> = Arc::downgrade(&self.inner);
        Ok(TimerHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.lock().timers.retain(|t| t.id != id);
            }
        }))
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("active_timers", &self.active_timers())
            .finish()
    }
}
