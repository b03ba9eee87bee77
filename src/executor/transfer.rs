// File transfer between the controller and a host session

use std::path::Path;

use tracing::{debug, info};

use super::Session;
use crate::output::errors::EngineError;

fn local_io(path: &Path, what: &str, e: std::io::Error) -> EngineError {
    EngineError::Io {
        message: format!("{}: {}", what, e),
        path: Some(path.to_path_buf()),
    }
}

/// Make `remote` hold `contents`. Returns whether it was written; a file
/// that already matches is left alone, mode included.
pub async fn put(
    session: &dyn Session,
    remote: &str,
    contents: &[u8],
    mode: Option<u32>,
) -> Result<bool, EngineError> {
    if session.read_file(remote).await?.as_deref() == Some(contents) {
        debug!(host = session.host_name(), remote, "remote file already up to date");
        return Ok(false);
    }
    session.write_file(remote, contents, mode).await?;
    Ok(true)
}

/// Copy a controller file to `remote`, optionally setting its mode
pub async fn upload(
    session: &dyn Session,
    local: &Path,
    remote: &str,
    mode: Option<u32>,
) -> Result<bool, EngineError> {
    let contents = tokio::fs::read(local)
        .await
        .map_err(|e| local_io(local, "Failed to read local file", e))?;

    info!(host = session.host_name(), local = %local.display(), remote, "uploading file");
    put(session, remote, &contents, mode).await
}

/// Copy `remote` from the host into a controller file
pub async fn download(session: &dyn Session, remote: &str, local: &Path) -> Result<(), EngineError> {
    info!(host = session.host_name(), remote, local = %local.display(), "downloading file");

    let contents = session
        .read_file(remote)
        .await?
        .ok_or_else(|| EngineError::Transfer {
            host: session.host_name().to_string(),
            path: remote.to_string(),
            message: "no such file".to_string(),
        })?;

    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| local_io(parent, "Failed to create directory", e))?;
    }
    tokio::fs::write(local, contents)
        .await
        .map_err(|e| local_io(local, "Failed to write local file", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalSession;

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.conf");
        std::fs::write(&source, "listen 8080\n").unwrap();
        let remote = dir.path().join("remote.conf");
        let back = dir.path().join("fetched/app.conf");

        let session = LocalSession::new("localhost");
        let remote = remote.to_str().unwrap();
        assert!(upload(&session, &source, remote, Some(0o644)).await.unwrap());
        // Same bytes again: nothing to write
        assert!(!upload(&session, &source, remote, Some(0o644)).await.unwrap());

        download(&session, remote, &back).await.unwrap();
        assert_eq!(std::fs::read_to_string(back).unwrap(), "listen 8080\n");

        std::fs::write(&source, "listen 9090\n").unwrap();
        assert!(upload(&session, &source, remote, None).await.unwrap());
        assert_eq!(std::fs::read_to_string(remote).unwrap(), "listen 9090\n");
    }

    #[tokio::test]
    async fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = LocalSession::new("localhost");

        let err = upload(&session, &dir.path().join("absent"), "/tmp/x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));

        let missing = dir.path().join("absent-remote");
        let err = download(&session, missing.to_str().unwrap(), &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transfer { .. }));
    }
}
