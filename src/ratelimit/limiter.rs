//! Fixed-window limiter with a backlog of deferred callables.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::scheduler::{Scheduler, Tick, TimerHandle, TokioScheduler};
use crate::config::{LimiterConfig, WindowConfig};
use crate::error::Result;

/// A deferred unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Mutable window state, shared between callers and the window timer.
struct WindowState {
    /// Whether the window timer is running
    started: bool,
    /// Deferred callables. Drained from the end, so the most recently
    /// submitted callable runs first.
    backlog: Vec<Job>,
    /// Quota left in the current window; `None` until the first window opens
    remaining: Option<u64>,
    /// Estimated start of the next window
    next_window_at: Option<DateTime<Utc>>,
}

struct Shared {
    window: WindowConfig,
    state: Mutex<WindowState>,
}

impl Shared {
    /// Reset the quota and drain the backlog into the fresh window.
    fn open_window(&self) {
        {
            let mut state = self.state.lock();
            state.next_window_at = chrono::Duration::from_std(self.window.duration())
                .ok()
                .and_then(|length| Utc::now().checked_add_signed(length));
            state.remaining = Some(self.window.size);

            trace!(
                size = self.window.size,
                backlog = state.backlog.len(),
                "Opening window"
            );
        }

        while let Some(job) = self.take_backlogged() {
            job();
        }
    }

    /// Pop the newest backlogged callable, reserving one unit of quota for it.
    fn take_backlogged(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let remaining = match state.remaining {
            Some(remaining) if remaining > 0 => remaining,
            _ => return None,
        };

        let job = state.backlog.pop()?;
        state.remaining = Some(remaining - 1);
        trace!(
            remaining = remaining - 1,
            backlog = state.backlog.len(),
            "Executing backlogged callable"
        );
        Some(job)
    }
}

/// Admits at most `window.size` callables every `window.length` milliseconds.
///
/// Callables submitted while quota remains (and nothing is waiting) run on
/// the submitting thread before `submit` returns. Everything else goes to the
/// backlog and runs at a later window boundary, on whichever thread drives
/// the scheduler.
///
/// Quota is reserved before a callable runs and no lock is held while it
/// runs, so a callable may submit to the limiter that is running it.
pub struct Limiter {
    shared: Arc<Shared>,
    scheduler: Arc<dyn Scheduler>,
    timer: Mutex<Option<TimerHandle>>,
}

impl Limiter {
    /// Create a stopped limiter whose windows are timed by tokio.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_scheduler(config, Arc::new(TokioScheduler::new()))
    }

    /// Create a stopped limiter from an untyped window config.
    pub fn from_value(value: Value) -> Result<Self> {
        Self::new(LimiterConfig::from_value(value)?)
    }

    /// Create a stopped limiter whose windows are timed by `scheduler`.
    pub fn with_scheduler(config: LimiterConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                window: config.window,
                state: Mutex::new(WindowState {
                    started: false,
                    backlog: Vec::new(),
                    remaining: None,
                    next_window_at: None,
                }),
            }),
            scheduler,
            timer: Mutex::new(None),
        })
    }

    /// Submit a callable: run it now if the window allows, otherwise
    /// backlog it.
    pub fn submit<F>(&self, job: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_job(Box::new(job))
    }

    /// Submit a callable if there is one. `None` is ignored.
    pub fn submit_opt<F>(&self, job: Option<F>) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        match job {
            Some(job) => self.submit(job),
            None => self,
        }
    }

    /// Alias of [`Limiter::submit`].
    pub fn enqueue<F>(&self, job: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(job)
    }

    /// Alias of [`Limiter::submit`].
    pub fn add<F>(&self, job: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(job)
    }

    fn submit_job(&self, job: Job) -> &Self {
        let run_now = {
            let mut state = self.shared.state.lock();
            let remaining = state.remaining;
            match remaining {
                Some(remaining) if state.started && state.backlog.is_empty() && remaining > 0 => {
                    state.remaining = Some(remaining - 1);
                    Some(job)
                }
                _ => {
                    state.backlog.push(job);
                    debug!(
                        backlog = state.backlog.len(),
                        started = state.started,
                        "Queueing callable"
                    );
                    None
                }
            }
        };

        if let Some(job) = run_now {
            debug!("Executing callable immediately");
            job();
        }

        self
    }

    /// Open a window now and every `window.length` milliseconds after.
    ///
    /// Calling this on a running limiter replaces its timer rather than
    /// adding a second one.
    pub fn start(&self) -> Result<&Self> {
        debug!(
            size = self.shared.window.size,
            length_ms = self.shared.window.length,
            "Starting limiter"
        );

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let tick: Tick = Arc::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.open_window();
            }
        });

        let handle = self
            .scheduler
            .schedule_repeating(self.shared.window.duration(), tick)?;

        // a panicking backlogged callable unwinds here and drops `handle`,
        // leaving no timer behind
        self.shared.open_window();

        let previous = self.timer.lock().replace(handle);
        if let Some(previous) = previous {
            debug!("Replacing running window timer");
            previous.cancel();
        }
        self.shared.state.lock().started = true;
        Ok(self)
    }

    /// Alias of [`Limiter::start`].
    pub fn sink(&self) -> Result<&Self> {
        self.start()
    }

    /// Cancel the window timer. The backlog is kept for the next start.
    pub fn stop(&self) -> &Self {
        debug!("Stopping limiter");

        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            handle.cancel();
        }
        self.shared.state.lock().started = false;
        self
    }

    /// Snapshot of the current window and backlog.
    pub fn stats(&self) -> LimiterStats {
        let state = self.shared.state.lock();
        LimiterStats {
            queue: QueueStats {
                length: state.backlog.len(),
            },
            window: WindowStats {
                size: self.shared.window.size,
                length: self.shared.window.length,
                remaining: state
                    .remaining
                    .map_or(-1, |r| i64::try_from(r).unwrap_or(i64::MAX)),
                next: state.next_window_at,
            },
        }
    }

    /// The window this limiter enforces.
    pub fn config(&self) -> LimiterConfig {
        LimiterConfig {
            window: self.shared.window,
        }
    }

    /// Whether the window timer is running.
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Number of backlogged callables.
    pub fn backlog_len(&self) -> usize {
        self.shared.state.lock().backlog.len()
    }

    /// Quota left in the current window, or `None` before the first window.
    pub fn remaining(&self) -> Option<u64> {
        self.shared.state.lock().remaining
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        let pending = self.shared.state.lock().backlog.len();
        if pending > 0 {
            warn!(pending, "Dropping limiter with backlogged callables");
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Limiter")
            .field("window", &self.shared.window)
            .field("started", &state.started)
            .field("backlog", &state.backlog.len())
            .field("remaining", &state.remaining)
            .finish()
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStats {
    /// Backlog statistics
    pub queue: QueueStats,
    /// Current window statistics
    pub window: WindowStats,
}

/// Backlog statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of backlogged callables
    pub length: usize,
}

/// Window statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Maximum callables per window
    pub size: u64,
    /// Window duration in milliseconds
    pub length: u64,
    /// Quota left in the current window, `-1` before the first window
    pub remaining: i64,
    /// Estimated start of the next window
    pub next: Option<DateTime<Utc>>,
}
