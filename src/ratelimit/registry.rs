//! Labeled registry of independently windowed limiters.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::limiter::{Limiter, LimiterStats};
use super::scheduler::{Scheduler, TokioScheduler};
use crate::config::{LimiterConfig, SluiceConfig};
use crate::error::{Result, SluiceError};

/// Maps labels to limiters.
///
/// A limiter added here stays stopped until the first callable is submitted
/// under its label.
pub struct Registry {
    /// Limiters indexed by label
    limiters: DashMap<String, Arc<Limiter>>,
    /// Labels whose limiter has not been started yet
    pending_start: Mutex<HashSet<String>>,
    /// Scheduler handed to every limiter this registry creates
    scheduler: Arc<dyn Scheduler>,
}

impl Registry {
    /// Create an empty registry whose limiters are timed by tokio.
    pub fn new() -> Self {
        Self::with_scheduler(Arc::new(TokioScheduler::new()))
    }

    /// Create an empty registry whose limiters are timed by `scheduler`.
    pub fn with_scheduler(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            limiters: DashMap::new(),
            pending_start: Mutex::new(HashSet::new()),
            scheduler,
        }
    }

    /// Create a registry holding every limiter in `config`.
    pub fn from_config(config: &SluiceConfig) -> Result<Self> {
        let registry = Self::new();
        registry.add_all(config)?;
        Ok(registry)
    }

    /// Add every limiter in `config`. Stops at the first failing label.
    pub fn add_all(&self, config: &SluiceConfig) -> Result<()> {
        for (label, limiter_config) in &config.limiters {
            self.add(label.as_str(), *limiter_config)?;
        }
        info!(limiters = config.limiters.len(), "Limiter table loaded");
        Ok(())
    }

    /// Register a new, not yet started limiter under `label`.
    pub fn add(&self, label: impl Into<String>, config: LimiterConfig) -> Result<Arc<Limiter>> {
        let label = label.into();

        match self.limiters.entry(label.clone()) {
            Entry::Occupied(_) => Err(SluiceError::DuplicateLabel(label)),
            Entry::Vacant(slot) => {
                let limiter = Arc::new(Limiter::with_scheduler(
                    config,
                    Arc::clone(&self.scheduler),
                )?);
                self.pending_start.lock().insert(label.clone());
                slot.insert(Arc::clone(&limiter));

                debug!(
                    label = %label,
                    size = config.window.size,
                    length_ms = config.window.length,
                    "Adding limiter"
                );
                Ok(limiter)
            }
        }
    }

    /// Look up the limiter registered under `label`.
    pub fn get(&self, label: &str) -> Result<Arc<Limiter>> {
        self.limiters
            .get(label)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SluiceError::UnknownLabel(label.to_string()))
    }

    /// Submit a callable to the limiter under `label`, starting that limiter
    /// if this is its first submission.
    pub fn submit<F>(&self, label: &str, job: F) -> Result<&Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let limiter = self.get(label)?;
        self.start_if_pending(label, &limiter)?;

        debug!(label = %label, "Submitting callable");
        limiter.submit(job);
        Ok(self)
    }

    /// Submit a callable if there is one.
    ///
    /// `None` still fails for an unknown label but otherwise changes nothing,
    /// and does not count as the first submission.
    pub fn submit_opt<F>(&self, label: &str, job: Option<F>) -> Result<&Self>
    where
        F: FnOnce() + Send + 'static,
    {
        match job {
            Some(job) => self.submit(label, job),
            None => {
                self.get(label)?;
                Ok(self)
            }
        }
    }

    /// Alias of [`Registry::submit`].
    pub fn enqueue<F>(&self, label: &str, job: F) -> Result<&Self>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(label, job)
    }

    fn start_if_pending(&self, label: &str, limiter: &Limiter) -> Result<()> {
        let pending = self.pending_start.lock().remove(label);
        if !pending {
            return Ok(());
        }

        debug!(label = %label, "Starting limiter on first submission");
        // restores the mark if start fails or unwinds
        let mut restore = PendingMark {
            pending_start: &self.pending_start,
            label: Some(label),
        };
        limiter.start()?;
        restore.label = None;
        Ok(())
    }

    /// Snapshot of the limiter under `label`.
    pub fn stats(&self, label: &str) -> Result<LimiterStats> {
        Ok(self.get(label)?.stats())
    }

    /// Stop the limiter under `label` and return it.
    pub fn stop(&self, label: &str) -> Result<Arc<Limiter>> {
        let limiter = self.get(label)?;
        debug!(label = %label, "Stopping limiter");
        limiter.stop();
        Ok(limiter)
    }

    /// Whether the limiter under `label` is still waiting for its first
    /// submission.
    pub fn is_pending_start(&self, label: &str) -> bool {
        self.pending_start.lock().contains(label)
    }

    /// Labels of all registered limiters, sorted.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        labels.sort();
        labels
    }

    /// Number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no limiter is registered.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

/// Puts a label back into the pending-start set when dropped, unless
/// disarmed by clearing `label`.
struct PendingMark<'a> {
    pending_start: &'a Mutex<HashSet<String>>,
    label: Option<&'a str>,
}

impl Drop for PendingMark<'_> {
    fn drop(&mut self) {
        if let Some(label) = self.label.take() {
            self.pending_start.lock().insert(label.to_string());
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("labels", &self.labels())
            .field("pending_start", &self.pending_start.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::scheduler::ManualScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn manual_registry() -> (Registry, ManualScheduler) {
        crate::init_test_tracing();
        let scheduler = ManualScheduler::new();
        let registry = Registry::with_scheduler(Arc::new(scheduler.clone()));
        (registry, scheduler)
    }

    fn generic() -> LimiterConfig {
        LimiterConfig::new(1, 1000).unwrap()
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(count: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_registry_creation() {
        let (registry, _) = manual_registry();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_add_returns_new_limiter() {
        let (registry, _) = manual_registry();
        let limiter = assert_ok!(registry.add("github", generic()));

        assert!(Arc::ptr_eq(&limiter, &assert_ok!(registry.get("github"))));
        assert_eq!(registry.labels(), vec!["github".to_string()]);
    }

    #[test]
    fn test_add_duplicate_label() {
        let (registry, _) = manual_registry();
        let config = LimiterConfig::new(2, 500).unwrap();
        let first = assert_ok!(registry.add("x", config));

        let err = assert_err!(registry.add("x", generic()));
        assert!(matches!(err, SluiceError::DuplicateLabel(ref label) if label == "x"));

        // the first limiter is untouched
        assert!(Arc::ptr_eq(&first, &assert_ok!(registry.get("x"))));
        assert_eq!(assert_ok!(registry.stats("x")).window.size, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_invalid_config() {
        let (registry, _) = manual_registry();
        let config = LimiterConfig {
            window: crate::config::WindowConfig { size: 1, length: 0 },
        };

        let err = assert_err!(registry.add("broken", config));
        assert!(matches!(err, SluiceError::InvalidConfiguration(_)));
        assert!(registry.is_empty());
        assert!(!registry.is_pending_start("broken"));
    }

    #[test]
    fn test_unknown_label() {
        let (registry, _) = manual_registry();

        let err = assert_err!(registry.submit("missing", || {}));
        assert!(matches!(err, SluiceError::UnknownLabel(ref label) if label == "missing"));

        assert!(matches!(
            registry.stats("missing"),
            Err(SluiceError::UnknownLabel(_))
        ));
        assert!(matches!(
            registry.stop("missing"),
            Err(SluiceError::UnknownLabel(_))
        ));
        assert!(matches!(
            registry.submit_opt("missing", None::<fn()>),
            Err(SluiceError::UnknownLabel(_))
        ));
    }

    #[test]
    fn test_limiter_starts_on_first_submit() {
        let (registry, scheduler) = manual_registry();
        let config = LimiterConfig::new(2, 1000).unwrap();
        let limiter = assert_ok!(registry.add("lazy", config));

        assert!(registry.is_pending_start("lazy"));
        assert!(!limiter.is_started());
        assert_eq!(assert_ok!(registry.stats("lazy")).window.remaining, -1);
        assert_eq!(scheduler.active_timers(), 0);

        let count = counter();
        assert_ok!(registry.submit("lazy", bump(&count)));

        assert!(!registry.is_pending_start("lazy"));
        assert!(limiter.is_started());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.remaining(), Some(1));
        assert_eq!(scheduler.active_timers(), 1);

        // later submissions do not restart the window
        assert_ok!(registry.submit("lazy", bump(&count)));
        assert_ok!(registry.submit("lazy", bump(&count)));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.backlog_len(), 1);
        assert_eq!(scheduler.active_timers(), 1);
    }

    #[test]
    fn test_submit_none_does_not_start() {
        let (registry, scheduler) = manual_registry();
        let limiter = assert_ok!(registry.add("idle", generic()));

        let returned = assert_ok!(registry.submit_opt("idle", None::<fn()>));
        assert!(std::ptr::eq(returned, &registry));
        assert!(registry.is_pending_start("idle"));
        assert!(!limiter.is_started());
        assert_eq!(scheduler.active_timers(), 0);
    }

    #[test]
    fn test_submit_chains() {
        let (registry, _) = manual_registry();
        registry.add("chain", generic()).unwrap();
        let count = counter();

        registry
            .submit("chain", bump(&count))
            .unwrap()
            .enqueue("chain", bump(&count))
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(assert_ok!(registry.stats("chain")).queue.length, 1);
    }

    #[test]
    fn test_stats_match_limiter() {
        let (registry, _) = manual_registry();
        let limiter = registry.add("stats", generic()).unwrap();
        registry.submit("stats", || {}).unwrap();
        registry.submit("stats", || {}).unwrap();

        assert_eq!(assert_ok!(registry.stats("stats")), limiter.stats());
    }

    #[test]
    fn test_stop_returns_limiter_and_halts_windows() {
        let (registry, scheduler) = manual_registry();
        let config = LimiterConfig::new(2, 1500).unwrap();
        let limiter = registry.add("stop", config).unwrap();

        registry
            .submit("stop", || {})
            .unwrap()
            .submit("stop", || {})
            .unwrap()
            .submit("stop", || panic!("ran after stop"))
            .unwrap();

        let stopped = assert_ok!(registry.stop("stop"));
        assert!(Arc::ptr_eq(&stopped, &limiter));
        assert!(!stopped.is_started());

        scheduler.advance(Duration::from_millis(10_000));
        assert_eq!(stopped.backlog_len(), 1);
    }

    #[test]
    fn test_labels_have_independent_windows() {
        let (registry, scheduler) = manual_registry();
        registry.add("fast", LimiterConfig::new(1, 100).unwrap()).unwrap();
        registry.add("slow", LimiterConfig::new(1, 1000).unwrap()).unwrap();
        let fast = counter();
        let slow = counter();

        for _ in 0..3 {
            registry.submit("fast", bump(&fast)).unwrap();
            registry.submit("slow", bump(&slow)).unwrap();
        }
        assert_eq!(fast.load(Ordering::SeqCst), 1);
        assert_eq!(slow.load(Ordering::SeqCst), 1);

        scheduler.advance(Duration::from_millis(200));
        assert_eq!(fast.load(Ordering::SeqCst), 3);
        assert_eq!(slow.load(Ordering::SeqCst), 1);

        scheduler.advance(Duration::from_millis(800));
        assert_eq!(slow.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_from_config_adds_pending_limiters() {
        let yaml = r#"
limiters:
  github:
    window:
      size: 30
      length: 60000
  slack:
    window:
      size: 1
      length: 1000
"#;
        let config = SluiceConfig::from_yaml(yaml).unwrap();
        let registry = assert_ok!(Registry::from_config(&config));

        assert_eq!(registry.labels(), vec!["github".to_string(), "slack".to_string()]);
        assert!(registry.is_pending_start("github"));
        assert!(registry.is_pending_start("slack"));
        assert_eq!(assert_ok!(registry.stats("github")).window.size, 30);
    }

    #[test]
    fn test_add_all_rejects_existing_label() {
        let (registry, _) = manual_registry();
        registry.add("slack", generic()).unwrap();

        let mut config = SluiceConfig::new();
        config.limiters.insert("slack".to_string(), generic());
        assert!(matches!(
            registry.add_all(&config),
            Err(SluiceError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn test_panicking_start_stays_pending() {
        let (registry, scheduler) = manual_registry();
        let limiter = registry
            .add("flaky", LimiterConfig::new(5, 100).unwrap())
            .unwrap();
        limiter.submit(|| panic!("backlogged callable failed"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = registry.submit("flaky", || {});
        }));
        assert!(result.is_err());
        assert!(registry.is_pending_start("flaky"));
        assert_eq!(scheduler.active_timers(), 0);

        // the next submission retries the start
        let count = counter();
        assert_ok!(registry.submit("flaky", bump(&count)));
        assert!(!registry.is_pending_start("flaky"));
        assert!(limiter.is_started());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_timers(), 1);
    }

    #[test]
    fn test_failed_start_stays_pending() {
        let registry = Registry::new();
        registry.add("offline", generic()).unwrap();

        // no tokio runtime on this thread
        let err = assert_err!(registry.submit("offline", || {}));
        assert!(matches!(err, SluiceError::SchedulerUnavailable(_)));
        assert!(registry.is_pending_start("offline"));
        assert_eq!(assert_ok!(registry.stats("offline")).queue.length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_registry_end_to_end() {
        crate::init_test_tracing();
        let registry = Registry::new();
        registry.add("api", LimiterConfig::new(2, 500).unwrap()).unwrap();
        let count = counter();

        for _ in 0..5 {
            registry.submit("api", bump(&count)).unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(510)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(assert_ok!(registry.stats("api")).window.remaining, 1);

        registry.stop("api").unwrap();
    }
}
