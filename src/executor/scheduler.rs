// Task scheduler - walks the plan with a per-task barrier

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::retry::{retry, Retried, RetryFailure};
use super::EngineContext;
use crate::inventory::{Host, Inventory};
use crate::output::errors::{EngineError, ErrorKind};
use crate::output::report::{ExecutionResult, HostState, RunReport};
use crate::plan::{Task, TaskPlan};

/// Runs a plan against an inventory.
///
/// Tasks run in plan order. Within a task every eligible host runs
/// concurrently, and the next task starts only after all of them finished.
pub struct Scheduler {
    ctx: Arc<EngineContext>,
}

impl Scheduler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Scheduler { ctx }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub async fn run(&self, plan: &TaskPlan, inventory: &Inventory) -> RunReport {
        let span = info_span!("run", tasks = plan.len(), hosts = inventory.len());
        self.run_inner(plan, inventory).instrument(span).await
    }

    async fn run_inner(&self, plan: &TaskPlan, inventory: &Inventory) -> RunReport {
        let ctx = &self.ctx;
        let aggregator = &ctx.aggregator;
        aggregator.register_hosts(inventory.hosts().iter().map(|h| h.name.as_str()));

        let dispatch = Semaphore::new(ctx.config.max_global.max(1));

        for task in plan {
            let targets = inventory.select(&task.selector);

            if ctx.is_cancelled() {
                for host in &targets {
                    aggregator.record(skipped_cancelled(task, &host.name));
                }
                continue;
            }

            let task_span = info_span!("task", index = task.index, name = %task.name);
            async {
                info!(module = %task.module_name, targets = targets.len(), "task started");

                let mut units = Vec::with_capacity(targets.len());
                for host in targets {
                    let state = aggregator.host_state(&host.name);
                    if state.is_excluded() {
                        aggregator.record(ExecutionResult::skipped(
                            task.index,
                            &task.name,
                            &host.name,
                            skip_reason(state),
                        ));
                    } else {
                        units.push(self.run_unit(task, host, &dispatch));
                    }
                }

                // Barrier: every unit of this task finishes before the next task
                join_all(units).await;
                ctx.pool.reap_expired().await;

                info!("task barrier reached");
            }
            .instrument(task_span)
            .await;
        }

        if ctx.is_cancelled() {
            warn!("run cancelled");
            aggregator.mark_cancelled();
            ctx.pool.close_all().await;
        }

        aggregator.finish();
        aggregator.report()
    }

    /// One (task, host) unit: acquire, execute, release, under retry
    async fn run_unit(&self, task: &Task, host: Arc<Host>, dispatch: &Semaphore) {
        let ctx = &*self.ctx;
        let cancel = ctx.cancel_token();

        let _slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ctx.aggregator.record(skipped_cancelled(task, &host.name));
                return;
            }
            permit = dispatch.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    ctx.aggregator.record(skipped_cancelled(task, &host.name));
                    return;
                }
            },
        };

        debug!(host = %host.name, "unit dispatched");
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let policy = task.retry.as_ref().unwrap_or(&ctx.retry);

        let host_ref: &Host = &host;
        let attempts_ref = &attempts;
        let work = retry(policy, &cancel, move |attempt| async move {
            attempts_ref.store(attempt, Ordering::Relaxed);
            attempt_once(ctx, task, host_ref).await
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetryFailure {
                error: EngineError::Cancelled,
                attempts: attempts.load(Ordering::Relaxed),
            }),
            outcome = work => outcome,
        };

        match outcome {
            Ok(Retried { value, attempts }) => {
                debug!(host = %host.name, status = %value.status, attempts, "unit finished");
                ctx.aggregator.record(value.with_attempts(attempts));
            }
            Err(RetryFailure { error, attempts }) => {
                let elapsed = started.elapsed();

                if matches!(error.root(), EngineError::Cancelled) {
                    ctx.aggregator.record(
                        ExecutionResult::cancelled(task.index, &task.name, &host.name)
                            .with_attempts(attempts)
                            .with_duration(elapsed),
                    );
                    return;
                }

                warn!(host = %host.name, attempts, error = %error, "unit failed");
                let result = ExecutionResult::from_error(task.index, &task.name, &host.name, &error)
                    .with_attempts(attempts)
                    .with_duration(elapsed);

                if error.is_unreachable() {
                    ctx.aggregator.record_unreachable(result);
                } else {
                    ctx.aggregator.record(result);
                }
            }
        }
    }
}

/// A single attempt. The lease goes back to the pool unless the error says
/// the session is no longer trustworthy.
async fn attempt_once(
    ctx: &EngineContext,
    task: &Task,
    host: &Host,
) -> Result<ExecutionResult, EngineError> {
    let lease = ctx.pool.acquire(host).await?;

    match ctx.executor.execute(lease.session(), task).await {
        Ok(result) => {
            ctx.pool.release(lease).await;
            Ok(result)
        }
        Err(e) if e.invalidates_session() => {
            ctx.pool.invalidate(lease).await;
            Err(e)
        }
        Err(e) => {
            ctx.pool.release(lease).await;
            Err(e)
        }
    }
}

fn skipped_cancelled(task: &Task, host: &str) -> ExecutionResult {
    ExecutionResult::skipped(task.index, &task.name, host, "run cancelled before dispatch")
        .with_error(ErrorKind::Cancelled)
}

fn skip_reason(state: HostState) -> &'static str {
    match state {
        HostState::Unreachable => "host unreachable earlier in this run",
        _ => "host failed earlier in this run",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::executor::LocalConnector;
    use crate::modules::ModuleRegistry;
    use crate::output::report::ResultStatus;
    use crate::plan::{PlanBuilder, TaskSpec};
    use serde_json::json;

    fn local_inventory(names: &[&str]) -> Inventory {
        let mut inventory = Inventory::new();
        for name in names {
            inventory
                .add_host(Host::new(*name).with_address("127.0.0.1"))
                .unwrap();
        }
        inventory
    }

    #[tokio::test]
    async fn test_local_run_end_to_end() {
        let plan = PlanBuilder::new(ModuleRegistry::builtin())
            .task(TaskSpec::new("ping"))
            .task(TaskSpec::new("command").with_param("cmd", json!("echo hi")))
            .build()
            .unwrap();
        let inventory = local_inventory(&["a", "b"]);

        let ctx = Arc::new(EngineContext::new(EngineConfig::default(), Arc::new(LocalConnector)));
        let report = Scheduler::new(ctx).run(&plan, &inventory).await;

        assert!(report.overall_success());
        assert_eq!(report.log.len(), 4);
        assert_eq!(report.result(0, "a").unwrap().status, ResultStatus::Unchanged);
        let echoed = report.result(1, "b").unwrap();
        assert_eq!(echoed.status, ResultStatus::Changed);
        assert_eq!(echoed.output.trim(), "hi");
        assert_eq!(echoed.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let plan = PlanBuilder::new(ModuleRegistry::builtin())
            .task(TaskSpec::new("ping"))
            .build()
            .unwrap();
        let inventory = local_inventory(&["a"]);

        let ctx = Arc::new(EngineContext::new(EngineConfig::default(), Arc::new(LocalConnector)));
        ctx.cancel();
        let report = Scheduler::new(ctx).run(&plan, &inventory).await;

        let r = report.result(0, "a").unwrap();
        assert_eq!(r.status, ResultStatus::Skipped);
        assert_eq!(r.error, Some(ErrorKind::Cancelled));
        assert!(report.cancelled);
        assert_eq!(report.host_state("a"), Some(HostState::Ok));
    }
}
