// Local command execution without SSH

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::debug;

use super::capture::{read_capped_async, Captured};
use super::{CommandResult, Connector, Session};
use crate::inventory::Host;
use crate::output::errors::EngineError;

/// Connector for hosts that resolve to the controller itself
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, EngineError> {
        debug!(host = %host.name, "opening local session");
        Ok(Box::new(LocalSession::new(&host.name)))
    }
}

/// Local session for executing commands on localhost
pub struct LocalSession {
    host_name: String,
}

impl LocalSession {
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalSession {
            host_name: host_name.into(),
        }
    }

    fn transport(&self, what: &str, e: io::Error) -> EngineError {
        EngineError::Transport {
            host: self.host_name.clone(),
            message: format!("{}: {}", what, e),
        }
    }

    fn transfer(&self, path: &str, e: io::Error) -> EngineError {
        EngineError::Transfer {
            host: self.host_name.clone(),
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}

async fn capture<R: AsyncRead + Unpin>(pipe: Option<R>, limit: usize) -> io::Result<Captured> {
    match pipe {
        Some(pipe) => read_capped_async(pipe, limit).await,
        None => Ok(Captured::default()),
    }
}

#[async_trait]
impl Session for LocalSession {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, EngineError> {
        self.exec_capped(cmd, usize::MAX).await
    }

    async fn exec_capped(&self, cmd: &str, limit: usize) -> Result<CommandResult, EngineError> {
        // kill_on_drop terminates the child when a timeout or cancel drops us
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.transport("failed to execute local command", e))?;

        let (stdout, stderr) = tokio::join!(
            capture(child.stdout.take(), limit),
            capture(child.stderr.take(), limit)
        );
        let stdout = stdout.map_err(|e| self.transport("failed to read stdout", e))?;
        let stderr = stderr.map_err(|e| self.transport("failed to read stderr", e))?;

        let status = child
            .wait()
            .await
            .map_err(|e| self.transport("failed to wait for local command", e))?;

        Ok(CommandResult {
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.into_text(),
            stderr: stderr.into_text(),
            exit_code: status.code().unwrap_or(-1),
        })
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), EngineError> {
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| self.transfer(path, e))?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| self.transfer(path, e))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, EngineError> {
        match tokio::fs::read(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.transfer(path, e)),
        }
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_exec() {
        let session = LocalSession::new("localhost");
        let result = session.exec("echo 'hello world'").await.unwrap();

        assert!(result.success());
        assert!(result.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_local_exec_failure() {
        let session = LocalSession::new("localhost");
        let result = session.exec("echo oops >&2; exit 3").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_dropped_exec_does_not_block() {
        let session = LocalSession::new("localhost");
        let res = tokio::time::timeout(Duration::from_millis(100), session.exec("sleep 5")).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_is_not_an_error() {
        let session = LocalSession::new("localhost");
        let result = session.exec("printf 'caf\\351'").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "caf\u{FFFD}");
    }

    #[tokio::test]
    async fn test_capped_exec_bounds_memory() {
        let session = LocalSession::new("localhost");
        let result = session
            .exec_capped("head -c 2000000 /dev/zero | tr '\\0' a; echo done >&2", 1024)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.len(), 1024);
        assert!(result.truncated);
        assert_eq!(result.stderr.trim(), "done");
    }

    #[tokio::test]
    async fn test_file_round_trip_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd");
        let path = path.to_str().unwrap();
        let session = LocalSession::new("localhost");

        assert_eq!(session.read_file(path).await.unwrap(), None);
        session.write_file(path, b"welcome\n", Some(0o600)).await.unwrap();
        assert_eq!(session.read_file(path).await.unwrap().unwrap(), b"welcome\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_write_into_missing_dir_is_transfer_error() {
        let session = LocalSession::new("localhost");
        let err = session
            .write_file("/nonexistent-dir/catalyst/file", b"x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transfer { .. }));
    }

    #[tokio::test]
    async fn test_connector_builds_session() {
        let host = Host::new("localhost");
        let session = LocalConnector.connect(&host).await.unwrap();
        assert_eq!(session.host_name(), "localhost");
    }
}
