//! Worker Pool (C8): schedules [`crate::pipeline::run`] invocations across tasks and runs with
//! bounded parallelism, honouring a global `max_workers` cap plus a per-service concurrency cap
//! (browser sessions default to 1, DB/filesystem default to `max_workers`, network services
//! default to 4 — §4.8). Cancellation uses the same `Arc<Notify>` + `AtomicBool` idiom as
//! [`crate::model::Cancellation`] rather than pulling in `tokio-util::CancellationToken`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::model::{Cancellation, ServiceName, TaskRunResult};
use crate::pipeline::{self, PipelineDeps};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-service worker cap overrides layered over `max_workers` (§4.8).
///
/// `Browser` always serialises to 1 session regardless of `max_workers`, since most task
/// catalogs assume exclusive ownership of the one headless profile the state manager prepares.
/// Notion/GitHub are network services and default to 4 concurrent sessions; Filesystem/Postgres
/// inherit the pool-wide `max_workers` figure since they have no shared external rate limit.
fn service_cap(service: ServiceName, max_workers: usize) -> usize {
    match service {
        ServiceName::Browser => 1,
        ServiceName::Filesystem | ServiceName::Postgres => max_workers,
        ServiceName::Notion | ServiceName::Github => max_workers.min(4).max(1),
    }
}

/// Pool-wide configuration (§4.8).
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Upper bound on total concurrently executing runs across every service.
    pub max_workers: usize,
    /// How long [`WorkerPool::shutdown`] waits for in-flight runs to finish their own `Clean`
    /// before returning regardless (§5 shared resource policy).
    pub drain_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            max_workers: 4,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// One queued unit of work: a fully prepared `RunContext` plus the dependencies its pipeline
/// invocation needs. `PipelineDeps` already carries this run's own [`Cancellation`] clone, so the
/// pool only needs to hold the service-level semaphore permit and the shared cancellation root.
pub struct ScheduledRun {
    pub ctx: crate::model::RunContext,
    pub deps: PipelineDeps,
}

/// Schedules [`ScheduledRun`]s across a bounded pool of `tokio::spawn`ed workers, enforcing both
/// the global `max_workers` cap and each service's own cap via one `Semaphore` per service.
///
/// Admission is FIFO per service: [`Semaphore::acquire`] queues waiters in arrival order, so two
/// runs against the same over-subscribed service are admitted in the order they were submitted,
/// matching §4.8's fairness requirement. Across services there is no shared ordering beyond the
/// global `max_workers` semaphore every run also has to acquire.
pub struct WorkerPool {
    global: Arc<Semaphore>,
    per_service: HashMap<ServiceName, Arc<Semaphore>>,
    cancel: Cancellation,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, cancel: Cancellation) -> Self {
        let mut per_service = HashMap::new();
        for service in [
            ServiceName::Notion,
            ServiceName::Github,
            ServiceName::Filesystem,
            ServiceName::Postgres,
            ServiceName::Browser,
        ] {
            per_service.insert(
                service,
                Arc::new(Semaphore::new(service_cap(service, config.max_workers))),
            );
        }
        WorkerPool {
            global: Arc::new(Semaphore::new(config.max_workers)),
            per_service,
            cancel,
            config,
        }
    }

    /// Signal the shared [`Cancellation`] and stop admitting new work. Already-running tasks
    /// observe cancellation on their next cooperative checkpoint and wind down through their own
    /// `Clean` before the task they were spawned on completes.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run every queued unit of work to completion, never admitting more than `max_workers`
    /// concurrently and never more than a service's own cap of that service's runs concurrently.
    /// Results are returned in the order their tasks complete, not submission order.
    ///
    /// `drain_timeout` only bounds how long this waits for in-flight runs *after* a shutdown has
    /// actually been requested (§4.8's graceful-shutdown drain); on the ordinary, non-cancelled
    /// path every handle is awaited unbounded; no per-run `wall_deadline` or verifier timeout is
    /// short enough for a batch of many runs to fit inside a 60s default drain window.
    pub async fn run_all(&self, runs: Vec<ScheduledRun>) -> Vec<TaskRunResult> {
        let mut pending = FuturesUnordered::new();

        for scheduled in runs {
            if self.cancel.is_cancelled() {
                log::warn!("worker_pool: shutdown requested, refusing to admit further runs");
                break;
            }

            let global = Arc::clone(&self.global);
            let per_service = self
                .per_service
                .get(&scheduled.ctx.task.service)
                .cloned()
                .expect("every ServiceName has a configured semaphore");

            pending.push(tokio::spawn(async move {
                let _global_permit = global.acquire_owned().await.ok()?;
                let _service_permit = per_service.acquire_owned().await.ok()?;
                Some(pipeline::run(&scheduled.ctx, &scheduled.deps).await)
            }));
        }

        let mut results = Vec::with_capacity(pending.len());
        loop {
            tokio::select! {
                biased;
                joined = pending.next() => {
                    match joined {
                        Some(Ok(Some(result))) => results.push(result),
                        Some(Ok(None)) => log::warn!("worker_pool: a run's semaphore closed before it ran"),
                        Some(Err(e)) => log::error!("worker_pool: run task panicked: {e}"),
                        None => break,
                    }
                }
                _ = self.cancel.cancelled() => {
                    log::warn!(
                        "worker_pool: shutdown requested with {} run(s) still in flight, draining up to {:?}",
                        pending.len(),
                        self.config.drain_timeout,
                    );
                    let remaining = self.config.drain_timeout;
                    let drained = tokio::time::timeout(remaining, async {
                        while let Some(joined) = pending.next().await {
                            match joined {
                                Ok(Some(result)) => results.push(result),
                                Ok(None) => log::warn!("worker_pool: a run's semaphore closed before it ran"),
                                Err(e) => log::error!("worker_pool: run task panicked: {e}"),
                            }
                        }
                    })
                    .await;
                    if drained.is_err() {
                        log::error!(
                            "worker_pool: drain timeout ({:?}) elapsed with {} run(s) still in flight",
                            self.config.drain_timeout,
                            pending.len(),
                        );
                    }
                    break;
                }
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_always_caps_at_one_regardless_of_max_workers() {
        assert_eq!(service_cap(ServiceName::Browser, 8), 1);
    }

    #[test]
    fn filesystem_inherits_max_workers() {
        assert_eq!(service_cap(ServiceName::Filesystem, 6), 6);
    }

    #[test]
    fn network_services_cap_at_four_by_default() {
        assert_eq!(service_cap(ServiceName::Notion, 8), 4);
        assert_eq!(service_cap(ServiceName::Github, 2), 2);
    }

    #[test]
    fn default_config_has_60s_drain_timeout() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(60));
    }
}
