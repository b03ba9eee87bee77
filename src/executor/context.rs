// Per-run engine context

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{ConnectionPool, Connector, ModuleExecutor, ResultAggregator, RetryPolicy};
use crate::config::EngineConfig;
use crate::output::events::EventReceiver;

/// Everything one run shares: pool, executor, aggregator, policies and the
/// cancellation token. Build a fresh context for every run.
pub struct EngineContext {
    pub config: EngineConfig,
    pub pool: ConnectionPool,
    pub executor: ModuleExecutor,
    pub aggregator: ResultAggregator,
    /// Used for tasks without their own policy
    pub retry: RetryPolicy,
    cancel: CancellationToken,
}

impl EngineContext {
    pub fn new(config: EngineConfig, connector: Arc<dyn Connector>) -> Self {
        EngineContext {
            pool: ConnectionPool::new(config.pool_config(), connector),
            executor: ModuleExecutor::new(config.task_timeout, config.output_limit),
            aggregator: ResultAggregator::new(config.event_buffer),
            retry: config.retry.clone(),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Token that aborts the run; clone it for signal handlers
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Live stream of results; subscribe before the run starts
    pub fn subscribe(&self) -> EventReceiver {
        self.aggregator.subscribe()
    }
}
