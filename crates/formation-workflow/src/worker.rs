//! Automation Worker
//!
//! Single consumer of the engine's automation queue. Each job runs through
//! [`WorkflowEngine`]'s automation entry point, so results are applied under
//! the instance lock like any other mutation. Up to
//! `automation_concurrency` jobs run at once.

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::engine::{AutomationQueue, WorkflowEngine};

pub struct AutomationWorker {
    engine: WorkflowEngine,
    queue: AutomationQueue,
}

impl AutomationWorker {
    pub fn new(engine: WorkflowEngine, queue: AutomationQueue) -> Self {
        Self { engine, queue }
    }

    /// Run until the shutdown signal flips to true. In-flight jobs are
    /// awaited before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let limit = self.engine.config().automation_concurrency.max(1);
        let mut in_flight = JoinSet::new();
        info!(concurrency = limit, "Automation worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            if in_flight.len() >= limit {
                tokio::select! {
                    Some(joined) = in_flight.join_next() => log_join(joined),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                job = self.queue.rx.recv() => {
                    let Some(job) = job else {
                        debug!("Automation queue closed");
                        break;
                    };
                    let engine = self.engine.clone();
                    in_flight.spawn(async move { engine.execute_job(job).await });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Automation worker shutting down");
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
    }

    /// Run every queued job to completion, one at a time, including jobs
    /// queued by the jobs themselves. Returns the number processed.
    pub async fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(job) = self.queue.rx.try_recv() {
            self.engine.execute_job(job).await;
            processed += 1;
        }
        processed
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Automation job task panicked or was cancelled");
    }
}
