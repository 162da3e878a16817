//! Periodic runner over all configured automations.
//!
//! A pass runs every non-suspended automation once, at most `concurrency`
//! at a time. Transient failures are retried with exponential backoff;
//! everything else is reported and left for the next pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};

use crate::engine::{CycleHint, CycleOutcome, SyncEngine};
use crate::error::Result;
use crate::loader::LoadedConfig;
use crate::resource::{ImageUpdateAutomation, ObjectKey, RetrySettings};

/// Outcome of one automation within a pass.
#[derive(Debug)]
pub struct CycleReport {
    pub target: ObjectKey,
    pub attempts: u32,
    pub result: Result<CycleOutcome>,
}

/// Summary counts of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub pushed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub suspended: usize,
}

/// Returns the delay before `attempt` (1-based retry number).
pub fn backoff_delay(retry: &RetrySettings, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_secs(retry.base_delay.saturating_mul(factor))
}

/// Runs passes of the engine over a configuration.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    retry: RetrySettings,
    concurrency: usize,
    /// Last commit and inputs seen per automation, used as the next cycle's hint.
    last_hints: Mutex<HashMap<ObjectKey, CycleHint>>,
    /// Prevents overlapping passes, so each target has at most one cycle in flight.
    pass_lock: tokio::sync::Mutex<()>,
    shutdown: Arc<AtomicBool>,
    wake: tokio::sync::Notify,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let settings = engine.settings();
        let retry = settings.retry.clone();
        let concurrency = settings.concurrency.max(1);
        Self {
            engine,
            retry,
            concurrency,
            last_hints: Mutex::new(HashMap::new()),
            pass_lock: tokio::sync::Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: tokio::sync::Notify::new(),
        }
    }

    /// Overrides the retry policy.
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the last commit recorded for `target`.
    pub fn last_commit(&self, target: &ObjectKey) -> Option<String> {
        self.last_hint(target).map(|hint| hint.commit)
    }

    /// Returns the hint recorded for `target`.
    pub fn last_hint(&self, target: &ObjectKey) -> Option<CycleHint> {
        self.last_hints
            .lock()
            .ok()
            .and_then(|hints| hints.get(target).cloned())
    }

    /// Runs every non-suspended automation once.
    ///
    /// Returns an empty list if another pass is still running.
    pub async fn run_once(&self, config: &LoadedConfig) -> Vec<CycleReport> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            log::info!("Pass skipped: another pass is already in progress");
            return Vec::new();
        };

        let automations: Vec<&ImageUpdateAutomation> = config
            .automations
            .iter()
            .map(|a| &a.resource)
            .filter(|a| {
                if a.spec.suspend {
                    log::debug!("{}: suspended, skipping", a.key());
                }
                !a.spec.suspend
            })
            .collect();

        stream::iter(automations)
            .map(|automation| self.run_with_retry(automation, config))
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    /// Runs one automation, retrying transient failures.
    pub async fn run_with_retry(
        &self,
        automation: &ImageUpdateAutomation,
        config: &LoadedConfig,
    ) -> CycleReport {
        let target = automation.key();
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = backoff_delay(&self.retry, attempt);
                log::info!(
                    "{}: retrying (attempt {}/{}) after {}s",
                    target,
                    attempt + 1,
                    self.retry.max_retries + 1,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }

            let hint = self.last_hint(&target);
            let result = self
                .engine
                .run_cycle(automation, config, hint.as_ref())
                .await;

            match result {
                Ok(outcome) => {
                    self.record(&target, outcome.hint());
                    return CycleReport {
                        target,
                        attempts: attempt + 1,
                        result: Ok(outcome),
                    };
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    log::warn!("{}: cycle failed with retryable error: {}", target, e);
                    attempt += 1;
                }
                Err(e) => {
                    log::error!(
                        "{}: cycle failed ({:?} error): {}",
                        target,
                        e.category(),
                        e
                    );
                    return CycleReport {
                        target,
                        attempts: attempt + 1,
                        result: Err(e),
                    };
                }
            }
        }
    }

    fn record(&self, target: &ObjectKey, hint: CycleHint) {
        if let Ok(mut hints) = self.last_hints.lock() {
            hints.insert(target.clone(), hint);
        }
    }

    /// Signals [`Scheduler::run`] to stop after the current pass.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Runs passes every `interval` until stopped.
    ///
    /// `load` is called before each pass so configuration edits are picked up.
    pub async fn run<F>(&self, interval: Duration, mut load: F)
    where
        F: FnMut() -> Result<LoadedConfig>,
    {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = self.wake.notified() => {}
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            match load() {
                Ok(config) => {
                    let summary = summarize(&config, &self.run_once(&config).await);
                    log::info!(
                        "Pass complete: {} pushed, {} unchanged, {} failed, {} suspended",
                        summary.pushed,
                        summary.unchanged,
                        summary.failed,
                        summary.suspended
                    );
                }
                Err(e) => log::error!("Failed to load configuration: {}", e),
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
        }
    }
}

/// Counts the outcomes of a pass.
pub fn summarize(config: &LoadedConfig, reports: &[CycleReport]) -> PassSummary {
    let mut summary = PassSummary {
        suspended: config
            .automations
            .iter()
            .filter(|a| a.resource.spec.suspend)
            .count(),
        ..Default::default()
    };
    for report in reports {
        match &report.result {
            Ok(outcome) if outcome.push.is_some() => summary.pushed += 1,
            Ok(_) => summary.unchanged += 1,
            Err(_) => summary.failed += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialResolver;
    use crate::error::SyncError;
    use crate::loader::LoadedConfig;
    use crate::resource::{
        CrossNamespaceSourceReference, ImageUpdateAutomationSpec, Resource, ResourceKind,
        ResourceWithPath, SettingsSpec,
    };
    use crate::secrets::InMemorySecretStore;

    fn engine() -> Arc<SyncEngine> {
        let credentials = Arc::new(CredentialResolver::new(Arc::new(InMemorySecretStore::new())));
        Arc::new(SyncEngine::new(credentials, SettingsSpec::default()).unwrap())
    }

    fn automation(name: &str, source: &str, suspend: bool) -> ResourceWithPath<ImageUpdateAutomation> {
        let mut spec =
            ImageUpdateAutomationSpec::new(CrossNamespaceSourceReference::git_repository(source));
        spec.suspend = suspend;
        ResourceWithPath::new(
            Resource::new(ResourceKind::ImageUpdateAutomation, name, spec),
            format!("{}.yaml", name),
        )
    }

    #[test]
    fn test_backoff_delay() {
        let retry = RetrySettings {
            max_retries: 3,
            base_delay: 2,
        };
        assert_eq!(backoff_delay(&retry, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_run_once_skips_suspended_and_reports_failures() {
        let mut config = LoadedConfig::default();
        config.automations.push(automation("active", "missing", false));
        config.automations.push(automation("paused", "missing", true));

        let scheduler = Scheduler::new(engine());
        let reports = scheduler.run_once(&config).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].target, ObjectKey::new("default", "active"));
        // Missing sources are configuration errors and are not retried
        assert_eq!(reports[0].attempts, 1);
        assert!(matches!(
            reports[0].result,
            Err(SyncError::ResourceNotFound { .. })
        ));

        let summary = summarize(&config, &reports);
        assert_eq!(
            summary,
            PassSummary {
                pushed: 0,
                unchanged: 0,
                failed: 1,
                suspended: 1
            }
        );
        assert!(scheduler.last_commit(&reports[0].target).is_none());
    }

    #[tokio::test]
    async fn test_run_stops_when_signalled() {
        let scheduler = Scheduler::new(engine());
        scheduler.stop();
        // Returns after the first tick without loading anything
        scheduler
            .run(Duration::from_millis(10), || {
                Err(SyncError::ConfigDirNotFound("unused".into()))
            })
            .await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_interval_wait() {
        let scheduler = Arc::new(Scheduler::new(engine()));
        let stopper = scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop();
        });

        let run = scheduler.run(Duration::from_secs(3600), || {
            Err(SyncError::ConfigDirNotFound("unused".into()))
        });
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not return after stop");
    }
}
