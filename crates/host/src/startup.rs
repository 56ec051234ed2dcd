//! Warm-start plumbing: named startup jobs with interval retries.
//!
//! Host startup runs every job once. Failures are logged and handed to a
//! background task that re-runs only the failing jobs on a fixed interval;
//! each success leaves the retry set, and a drained set stops the task.
//! Startup itself never fails because a job failed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::catalog::CatalogService;
use crate::loader::PackageLoader;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type JobFn = Box<dyn Fn() -> JobFuture + Send + Sync>;

/// A named unit of startup work, re-runnable until it succeeds.
pub struct InitializerJob {
    name: String,
    run: JobFn,
}

impl InitializerJob {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move || Box::pin(run())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self) -> anyhow::Result<()> {
        (self.run)().await
    }
}

/// The standard host jobs: load native packages once, then verify the
/// plugin catalog is readable.
pub fn standard_jobs(
    loader: Arc<PackageLoader>,
    catalog: Arc<CatalogService>,
) -> Vec<InitializerJob> {
    vec![
        InitializerJob::new("native-packages", move || {
            let loader = Arc::clone(&loader);
            async move {
                loader.ensure_loaded().await;
                Ok(())
            }
        }),
        InitializerJob::new("catalog-reload", move || {
            let catalog = Arc::clone(&catalog);
            async move {
                catalog.reload()?;
                Ok(())
            }
        }),
    ]
}

/// Runs startup jobs and retries the failures in the background.
pub struct PluginInitializer {
    jobs: Vec<InitializerJob>,
    retry_interval: Duration,
}

impl PluginInitializer {
    pub fn new(jobs: Vec<InitializerJob>) -> Self {
        Self {
            jobs,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Runs every job once; failed jobs move to the background retry task.
    pub async fn run(self) -> StartupReport {
        let mut failed = Vec::new();
        let mut pending = Vec::new();

        for job in self.jobs {
            match job.attempt().await {
                Ok(()) => debug!(job = %job.name, "startup job succeeded"),
                Err(err) => {
                    warn!(job = %job.name, error = %err, "startup job failed, will retry");
                    failed.push(job.name.clone());
                    pending.push(job);
                }
            }
        }

        let retry_task = if pending.is_empty() {
            None
        } else {
            Some(tokio::spawn(retry_loop(pending, self.retry_interval)))
        };
        StartupReport { failed, retry_task }
    }
}

/// What the first startup pass left behind.
pub struct StartupReport {
    pub failed: Vec<String>,
    retry_task: Option<JoinHandle<()>>,
}

impl StartupReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn retrying(&self) -> bool {
        self.retry_task.is_some()
    }

    /// Waits until every failed job has succeeded on retry.
    pub async fn wait_for_retries(self) {
        if let Some(task) = self.retry_task {
            let _ = task.await;
        }
    }

    /// Stops retrying, for host shutdown.
    pub fn abort_retries(&self) {
        if let Some(task) = &self.retry_task {
            task.abort();
        }
    }
}

async fn retry_loop(mut pending: Vec<InitializerJob>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so every retry
    // waits a full interval.
    ticker.tick().await;

    while !pending.is_empty() {
        ticker.tick().await;
        let mut still_failing = Vec::new();
        for job in pending {
            match job.attempt().await {
                Ok(()) => info!(job = %job.name, "startup job succeeded on retry"),
                Err(err) => {
                    warn!(job = %job.name, error = %err, "startup job still failing");
                    still_failing.push(job);
                }
            }
        }
        pending = still_failing;
    }
    debug!("startup retry set drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    fn counting_job(
        name: &str,
        attempts: &Arc<AtomicUsize>,
        fail_first: usize,
    ) -> InitializerJob {
        let attempts = Arc::clone(attempts);
        InitializerJob::new(name, move || {
            let attempts = Arc::clone(&attempts);
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= fail_first {
                    Err(anyhow!("attempt {attempt} refused"))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test]
    async fn successful_jobs_never_enter_the_retry_set() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let report = PluginInitializer::new(vec![counting_job("steady", &attempts, 0)])
            .with_retry_interval(Duration::from_millis(5))
            .run()
            .await;

        assert!(report.all_succeeded());
        assert!(!report.retrying());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_jobs_are_retried_until_they_succeed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let report = PluginInitializer::new(vec![counting_job("flaky", &attempts, 2)])
            .with_retry_interval(Duration::from_millis(10))
            .run()
            .await;

        assert_eq!(report.failed, ["flaky"]);
        assert!(report.retrying());

        tokio::time::timeout(Duration::from_secs(2), report.wait_for_retries())
            .await
            .expect("retry set should drain");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn only_failing_jobs_are_rerun() {
        let flaky_attempts = Arc::new(AtomicUsize::new(0));
        let steady_attempts = Arc::new(AtomicUsize::new(0));
        let report = PluginInitializer::new(vec![
            counting_job("flaky", &flaky_attempts, 1),
            counting_job("steady", &steady_attempts, 0),
        ])
        .with_retry_interval(Duration::from_millis(10))
        .run()
        .await;

        assert_eq!(report.failed, ["flaky"]);

        tokio::time::timeout(Duration::from_secs(2), report.wait_for_retries())
            .await
            .expect("retry set should drain");
        assert_eq!(flaky_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(steady_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_stops_a_stuck_retry_loop() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let report = PluginInitializer::new(vec![counting_job("doomed", &attempts, usize::MAX)])
            .with_retry_interval(Duration::from_millis(5))
            .run()
            .await;

        assert!(report.retrying());
        report.abort_retries();
        report.wait_for_retries().await;
    }
}
