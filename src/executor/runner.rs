// Runs one task on one host through a leased session

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{CommandResult, Session};
use crate::modules::ModuleOutcome;
use crate::output::errors::{EngineError, ErrorKind};
use crate::output::report::ExecutionResult;
use crate::plan::Task;

/// Module executor: timeout enforcement, output capture, status mapping
#[derive(Debug, Clone)]
pub struct ModuleExecutor {
    default_timeout: Duration,
    output_limit: usize,
}

impl Default for ModuleExecutor {
    fn default() -> Self {
        ModuleExecutor::new(Duration::from_secs(300), 64 * 1024)
    }
}

impl ModuleExecutor {
    pub fn new(default_timeout: Duration, output_limit: usize) -> Self {
        ModuleExecutor {
            default_timeout,
            output_limit,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn timeout_for(&self, task: &Task) -> Duration {
        task.timeout.unwrap_or(self.default_timeout)
    }

    /// Execute `task` over `session`.
    ///
    /// Module verdicts come back as `Ok` results (changed, unchanged,
    /// failed). Transport problems and timeouts come back as `Err` so the
    /// caller can retry them and discard the session.
    pub async fn execute(
        &self,
        session: &dyn Session,
        task: &Task,
    ) -> Result<ExecutionResult, EngineError> {
        let host = session.host_name();
        let timeout = self.timeout_for(task);
        let started = Instant::now();

        debug!(task = %task.name, host, module = %task.module_name, "running module");

        let capped = Capped {
            inner: session,
            limit: self.output_limit,
        };
        let run = task.module.run(&capped, &task.params);
        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(EngineError::Timeout {
                    operation: format!("task '{}' on {}", task.name, host),
                    after: timeout,
                })
            }
        };
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(outcome) => self.classify(task, host, outcome),
            // Module-level errors are verdicts, not transport trouble
            Err(
                e @ (EngineError::ModuleFailed { .. }
                | EngineError::InvalidParams { .. }
                | EngineError::Transfer { .. }),
            ) => ExecutionResult::failed(
                task.index,
                &task.name,
                host,
                ErrorKind::ModuleFailed,
                e.to_string(),
            ),
            Err(e) => return Err(e),
        };

        Ok(result.with_duration(elapsed))
    }

    fn classify(&self, task: &Task, host: &str, outcome: ModuleOutcome) -> ExecutionResult {
        let (output, cut) = bound_output(&outcome.stdout, &outcome.stderr, self.output_limit);
        let truncated = cut || outcome.truncated;

        let result = if outcome.exit_code != 0 {
            ExecutionResult::failed(
                task.index,
                &task.name,
                host,
                ErrorKind::ModuleFailed,
                format!("Command exited with code {}", outcome.exit_code),
            )
        } else if outcome.changed {
            ExecutionResult::changed(task.index, &task.name, host)
        } else {
            ExecutionResult::unchanged(task.index, &task.name, host)
        };

        result
            .with_exit_code(outcome.exit_code)
            .with_output(output, truncated)
    }
}

/// Session handed to modules: every command is captured under the output limit
struct Capped<'a> {
    inner: &'a dyn Session,
    limit: usize,
}

#[async_trait]
impl Session for Capped<'_> {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, EngineError> {
        self.inner.exec_capped(cmd, self.limit).await
    }

    async fn exec_capped(&self, cmd: &str, limit: usize) -> Result<CommandResult, EngineError> {
        self.inner.exec_capped(cmd, limit.min(self.limit)).await
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), EngineError> {
        self.inner.write_file(path, contents, mode).await
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.inner.read_file(path).await
    }

    fn host_name(&self) -> &str {
        self.inner.host_name()
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }
}

/// stdout followed by stderr, cut to at most `limit` bytes on a char boundary
pub fn bound_output(stdout: &str, stderr: &str, limit: usize) -> (String, bool) {
    let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
    combined.push_str(stdout);
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(stderr);
    }

    if combined.len() <= limit {
        return (combined, false);
    }

    let mut cut = limit;
    while !combined.is_char_boundary(cut) {
        cut -= 1;
    }
    combined.truncate(cut);
    (combined, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{Module, Params};
    use crate::output::report::ResultStatus;
    use crate::plan::Task;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Scripted {
        result: Result<CommandResult, fn() -> EngineError>,
        delay: Duration,
    }

    #[async_trait]
    impl Session for Scripted {
        async fn exec(&self, _cmd: &str) -> Result<CommandResult, EngineError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone().map_err(|f| f())
        }

        fn host_name(&self) -> &str {
            "web1"
        }
    }

    struct Echo {
        changed: bool,
    }

    #[async_trait]
    impl Module for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn run(
            &self,
            session: &dyn Session,
            _params: &Params,
        ) -> Result<ModuleOutcome, EngineError> {
            let result = session.exec("echo").await?;
            Ok(ModuleOutcome::from_command(result, self.changed))
        }
    }

    fn task(changed: bool) -> Task {
        Task::new(0, "echo", Arc::new(Echo { changed }))
    }

    fn session(exit_code: i32, stdout: &str) -> Scripted {
        Scripted {
            result: Ok(CommandResult {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
                truncated: false,
            }),
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let executor = ModuleExecutor::default();

        let r = executor.execute(&session(0, "ok"), &task(true)).await.unwrap();
        assert_eq!(r.status, ResultStatus::Changed);
        assert_eq!(r.output, "ok");

        let r = executor.execute(&session(0, ""), &task(false)).await.unwrap();
        assert_eq!(r.status, ResultStatus::Unchanged);

        let r = executor.execute(&session(2, ""), &task(true)).await.unwrap();
        assert_eq!(r.status, ResultStatus::Failed);
        assert_eq!(r.error, Some(ErrorKind::ModuleFailed));
        assert_eq!(r.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_transport_error_is_returned() {
        let executor = ModuleExecutor::default();
        let broken = Scripted {
            result: Err(|| EngineError::Transport {
                host: "web1".to_string(),
                message: "broken pipe".to_string(),
            }),
            delay: Duration::ZERO,
        };

        let err = executor.execute(&broken, &task(true)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let executor = ModuleExecutor::new(Duration::from_secs(1), 1024);
        let slow = Scripted {
            delay: Duration::from_secs(10),
            ..session(0, "")
        };

        let err = executor.execute(&slow, &task(true)).await.unwrap_err();
        let result = ExecutionResult::from_error(0, "echo", "web1", &err);
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error, Some(ErrorKind::Timeout));

        let mut quick = task(true);
        quick.timeout = Some(Duration::from_secs(20));
        assert!(executor.execute(&slow, &quick).await.is_ok());
    }

    #[test]
    fn test_bound_output() {
        assert_eq!(bound_output("out", "err", 100), ("out\nerr".to_string(), false));
        assert_eq!(bound_output("", "err", 100), ("err".to_string(), false));
        assert_eq!(bound_output("abcdef", "", 4), ("abcd".to_string(), true));

        // 'é' is two bytes; never split it
        let (out, truncated) = bound_output("aé", "", 2);
        assert_eq!(out, "a");
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_output_truncated_flag() {
        let executor = ModuleExecutor::new(Duration::from_secs(5), 8);
        let r = executor
            .execute(&session(0, "0123456789"), &task(true))
            .await
            .unwrap();
        assert_eq!(r.output, "01234567");
        assert!(r.truncated);
    }

    /// Records the limit each command was captured under
    #[derive(Default)]
    struct Streaming {
        limits: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Session for Streaming {
        async fn exec(&self, _cmd: &str) -> Result<CommandResult, EngineError> {
            panic!("modules must go through the capped path");
        }

        async fn exec_capped(&self, _cmd: &str, limit: usize) -> Result<CommandResult, EngineError> {
            self.limits.lock().push(limit);
            Ok(CommandResult {
                stdout: "x".repeat(limit),
                truncated: true,
                ..Default::default()
            })
        }

        fn host_name(&self) -> &str {
            "web1"
        }
    }

    #[tokio::test]
    async fn test_commands_run_under_output_limit() {
        let executor = ModuleExecutor::new(Duration::from_secs(5), 16);
        let session = Streaming::default();

        let r = executor.execute(&session, &task(true)).await.unwrap();
        assert_eq!(*session.limits.lock(), vec![16]);
        assert_eq!(r.output.len(), 16);
        // The transport dropped bytes even though the kept text fits
        assert!(r.truncated);
    }

    struct Uploader;

    #[async_trait]
    impl Module for Uploader {
        fn name(&self) -> &'static str {
            "uploader"
        }

        async fn run(
            &self,
            session: &dyn Session,
            _params: &Params,
        ) -> Result<ModuleOutcome, EngineError> {
            session.write_file("/etc/app.conf", b"x", None).await?;
            Ok(ModuleOutcome::default())
        }
    }

    #[tokio::test]
    async fn test_transfer_error_is_failed_result() {
        let executor = ModuleExecutor::default();
        let upload = Task::new(0, "upload", Arc::new(Uploader));

        // The scripted session keeps the default, unsupported transfer
        let r = executor.execute(&session(0, ""), &upload).await.unwrap();
        assert_eq!(r.status, ResultStatus::Failed);
        assert_eq!(r.error, Some(ErrorKind::ModuleFailed));
        assert!(r.message.as_deref().unwrap().contains("/etc/app.conf"));
    }
}
