// Executor module - task execution engine

use async_trait::async_trait;

use crate::inventory::Host;
use crate::output::errors::EngineError;

pub mod aggregator;
pub mod capture;
pub mod context;
pub mod local;
pub mod pool;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod ssh;
pub mod transfer;

pub use aggregator::ResultAggregator;
pub use context::EngineContext;
pub use local::{LocalConnector, LocalSession};
pub use pool::{ConnectionPool, Lease, PoolConfig, PoolStats};
pub use retry::{calculate_delay, retry, RetryPolicy};
pub use runner::ModuleExecutor;
pub use scheduler::Scheduler;
pub use ssh::{SshConnector, SshSession};
pub use transfer::{download, put, upload};

/// A live, authenticated channel to one host
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute a command and return the result.
    ///
    /// Dropping the returned future is the interrupt signal: implementations
    /// stop the remote operation where they can.
    async fn exec(&self, cmd: &str) -> Result<CommandResult, EngineError>;

    /// Like [`exec`](Session::exec), keeping at most `limit` bytes of each
    /// stream. Transports that read incrementally override this so large
    /// output is never held in memory.
    async fn exec_capped(&self, cmd: &str, limit: usize) -> Result<CommandResult, EngineError> {
        let mut result = self.exec(cmd).await?;
        result.cap(limit);
        Ok(result)
    }

    /// Create or replace `path` on the host
    async fn write_file(
        &self,
        path: &str,
        _contents: &[u8],
        _mode: Option<u32>,
    ) -> Result<(), EngineError> {
        Err(unsupported_transfer(self.host_name(), path))
    }

    /// Read `path` from the host; `None` if it does not exist
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, EngineError> {
        Err(unsupported_transfer(self.host_name(), path))
    }

    /// Get the host name for this session
    fn host_name(&self) -> &str;

    /// Whether the underlying transport still looks usable
    fn is_alive(&self) -> bool {
        true
    }

    /// Best-effort shutdown
    async fn close(&self) {}
}

fn unsupported_transfer(host: &str, path: &str) -> EngineError {
    EngineError::Transfer {
        host: host.to_string(),
        path: path.to_string(),
        message: "file transfer not supported by this transport".to_string(),
    }
}

/// Establishes sessions. Authentication happens here.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, EngineError>;
}

/// Result of executing a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Output past the capture limit was discarded
    pub truncated: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Cut each stream to at most `limit` bytes on a char boundary
    pub fn cap(&mut self, limit: usize) {
        for stream in [&mut self.stdout, &mut self.stderr] {
            if stream.len() > limit {
                let mut cut = limit;
                while !stream.is_char_boundary(cut) {
                    cut -= 1;
                }
                stream.truncate(cut);
                self.truncated = true;
            }
        }
    }
}

/// Default connector: local hosts run through a shell, everything else over SSH
pub struct AutoConnector {
    ssh: SshConnector,
}

impl AutoConnector {
    pub fn new(ssh: SshConnector) -> Self {
        AutoConnector { ssh }
    }
}

#[async_trait]
impl Connector for AutoConnector {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, EngineError> {
        if host.is_local() {
            LocalConnector.connect(host).await
        } else {
            self.ssh.connect(host).await
        }
    }
}
