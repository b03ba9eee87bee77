// SSH sessions over libssh2

use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ssh2::{ErrorCode, KeyboardInteractivePrompt, Session as Ssh2Session};
use tracing::{debug, warn};

use super::capture::read_capped;
use super::{CommandResult, Connector, Session};
use crate::inventory::{CredentialsRef, Host};
use crate::output::errors::EngineError;

/// Builds authenticated SSH sessions
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
    default_user: Option<String>,
    private_key_path: Option<PathBuf>,
    password: Option<String>,
}

impl SshConnector {
    pub fn new() -> Self {
        SshConnector {
            connect_timeout: Duration::from_secs(30),
            default_user: None,
            private_key_path: None,
            password: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_default_user(mut self, user: String) -> Self {
        self.default_user = Some(user);
        self
    }

    pub fn with_private_key(mut self, path: PathBuf) -> Self {
        self.private_key_path = Some(path);
        self
    }

    pub fn with_password(mut self, password: String) -> Self {
        self.password = Some(password);
        self
    }

    fn user_for(&self, host: &Host) -> String {
        if host.user.is_empty() {
            self.default_user
                .clone()
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "root".to_string())
        } else {
            host.user.clone()
        }
    }

    /// Blocking connect + handshake + authentication. The returned socket
    /// is a handle on the session's stream, kept so it can be shut down.
    fn connect_blocking(&self, host: &Host) -> Result<(Ssh2Session, TcpStream), EngineError> {
        let address = format!("{}:{}", host.address, host.port);

        let socket_addr = address
            .to_socket_addrs()
            .map_err(|e| EngineError::Connect {
                host: host.name.clone(),
                message: format!("cannot resolve {}: {}", address, e),
                suggestion: Some("Check the host address".to_string()),
            })?
            .next()
            .ok_or_else(|| EngineError::Connect {
                host: host.name.clone(),
                message: format!("no address found for {}", address),
                suggestion: Some("Check the host address".to_string()),
            })?;

        let tcp = TcpStream::connect_timeout(&socket_addr, self.connect_timeout).map_err(|e| {
            EngineError::Connect {
                host: host.name.clone(),
                message: format!("connection failed: {}", e),
                suggestion: ssh_connection_suggestion(&e),
            }
        })?;

        let socket = tcp.try_clone().map_err(|e| EngineError::Connect {
            host: host.name.clone(),
            message: format!("failed to clone socket: {}", e),
            suggestion: None,
        })?;

        let mut session = Ssh2Session::new().map_err(|e| EngineError::Connect {
            host: host.name.clone(),
            message: format!("failed to create SSH session: {}", e),
            suggestion: None,
        })?;

        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);

        session.handshake().map_err(|e| EngineError::Connect {
            host: host.name.clone(),
            message: format!("SSH handshake failed: {}", e),
            suggestion: Some("Check SSH service is running on the target".to_string()),
        })?;

        let user = self.user_for(host);
        if !self.authenticate(&session, host, &user) {
            return Err(EngineError::AuthFailed {
                host: host.name.clone(),
                message: format!("no accepted credentials for user '{}'", user),
            });
        }

        // Command duration is bounded by the executor, which severs the
        // socket when it gives up on a command
        session.set_timeout(0);
        Ok((session, socket))
    }

    fn authenticate(&self, session: &Ssh2Session, host: &Host, user: &str) -> bool {
        match &host.credentials {
            CredentialsRef::KeyFile(path) => {
                if try_key_file(session, user, path) {
                    return true;
                }
            }
            CredentialsRef::Password(password) => {
                if try_password(session, user, password) {
                    return true;
                }
            }
            CredentialsRef::Agent => {}
        }

        // Try SSH agent
        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                agent.list_identities().ok();
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(user, &identity).is_ok() {
                        return true;
                    }
                }
            }
        }

        // Connector-wide key, then the default key files
        let key_paths = self
            .private_key_path
            .iter()
            .cloned()
            .chain(
                [".ssh/id_ed25519", ".ssh/id_rsa"]
                    .into_iter()
                    .filter_map(|p| dirs::home_dir().map(|h| h.join(p))),
            )
            .collect::<Vec<_>>();

        for key_path in key_paths {
            if try_key_file(session, user, &key_path) {
                return true;
            }
        }

        if let Some(ref password) = self.password {
            if try_password(session, user, password) {
                return true;
            }
        }

        session.authenticated()
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn try_key_file(session: &Ssh2Session, user: &str, path: &Path) -> bool {
    let path = expand_home(path);
    path.exists() && session.userauth_pubkey_file(user, None, &path, None).is_ok()
}

fn try_password(session: &Ssh2Session, user: &str, password: &str) -> bool {
    if session.userauth_password(user, password).is_ok() {
        return true;
    }
    // Fall back to keyboard-interactive auth (used by some PAM configurations)
    let mut prompter = PasswordPrompter(password.to_string());
    session
        .userauth_keyboard_interactive(user, &mut prompter)
        .is_ok()
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, EngineError> {
        debug!(host = %host.name, target = %host.ssh_target(), "opening SSH session");

        let connector = self.clone();
        let owned = host.clone();
        let (session, socket) = tokio::task::spawn_blocking(move || connector.connect_blocking(&owned))
            .await
            .map_err(|e| EngineError::Connect {
                host: host.name.clone(),
                message: format!("connect task failed: {}", e),
                suggestion: None,
            })??;

        Ok(Box::new(SshSession {
            session: Arc::new(session),
            link: Arc::new(Link::new(socket)),
            host_name: host.name.clone(),
        }))
    }
}

/// The TCP stream under a session. Shutting it down makes any libssh2
/// call blocked on it return, whichever thread it runs on.
struct Link {
    socket: TcpStream,
    severed: AtomicBool,
}

impl Link {
    fn new(socket: TcpStream) -> Self {
        Link {
            socket,
            severed: AtomicBool::new(false),
        }
    }

    fn sever(&self) {
        if !self.severed.swap(true, Ordering::AcqRel) {
            self.socket.shutdown(Shutdown::Both).ok();
        }
    }

    fn is_severed(&self) -> bool {
        self.severed.load(Ordering::Acquire)
    }
}

/// Severs the link unless disarmed: an exec future dropped by a timeout or
/// a cancel must not leave its blocking reader running
struct SeverOnDrop<'a> {
    link: &'a Link,
    armed: bool,
}

impl<'a> SeverOnDrop<'a> {
    fn new(link: &'a Link) -> Self {
        SeverOnDrop { link, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SeverOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("abandoning in-flight SSH operation");
            self.link.sever();
        }
    }
}

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// An authenticated SSH session
pub struct SshSession {
    session: Arc<Ssh2Session>,
    link: Arc<Link>,
    host_name: String,
}

fn transport(host_name: &str, what: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Transport {
        host: host_name.to_string(),
        message: format!("{}: {}", what, e),
    }
}

fn transfer(host_name: &str, path: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Transfer {
        host: host_name.to_string(),
        path: path.to_string(),
        message: e.to_string(),
    }
}

/// LIBSSH2_FX_NO_SUCH_FILE
const SFTP_NO_SUCH_FILE: i32 = 2;

impl SshSession {
    fn exec_blocking(
        session: &Ssh2Session,
        host_name: &str,
        command: &str,
        limit: usize,
    ) -> Result<CommandResult, EngineError> {
        let mut channel = session
            .channel_session()
            .map_err(|e| transport(host_name, "failed to open channel", e))?;

        channel
            .exec(command)
            .map_err(|e| transport(host_name, "failed to execute command", e))?;

        let stdout = read_capped(&mut channel, limit)
            .map_err(|e| transport(host_name, "failed to read stdout", e))?;
        let stderr = read_capped(channel.stderr(), limit)
            .map_err(|e| transport(host_name, "failed to read stderr", e))?;

        channel.wait_close().ok();
        let exit_code = channel
            .exit_status()
            .map_err(|e| transport(host_name, "failed to read exit status", e))?;

        Ok(CommandResult {
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.into_text(),
            stderr: stderr.into_text(),
            exit_code,
        })
    }

    fn write_blocking(
        session: &Ssh2Session,
        host_name: &str,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), EngineError> {
        let sftp = session
            .sftp()
            .map_err(|e| transport(host_name, "failed to open SFTP", e))?;

        let mut remote = sftp
            .create(Path::new(path))
            .map_err(|e| transfer(host_name, path, e))?;
        remote
            .write_all(contents)
            .map_err(|e| transfer(host_name, path, e))?;
        drop(remote);

        if let Some(mode) = mode {
            let stat = ssh2::FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            };
            sftp.setstat(Path::new(path), stat)
                .map_err(|e| transfer(host_name, path, e))?;
        }
        Ok(())
    }

    fn read_blocking(
        session: &Ssh2Session,
        host_name: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let sftp = session
            .sftp()
            .map_err(|e| transport(host_name, "failed to open SFTP", e))?;

        let mut remote = match sftp.open(Path::new(path)) {
            Ok(file) => file,
            Err(e) if matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE)) => return Ok(None),
            Err(e) => return Err(transfer(host_name, path, e)),
        };

        let mut contents = Vec::new();
        remote
            .read_to_end(&mut contents)
            .map_err(|e| transfer(host_name, path, e))?;
        Ok(Some(contents))
    }

    /// Run a blocking libssh2 call on the blocking pool, severing the link
    /// if the caller stops waiting for it
    async fn blocking<T, F>(&self, op: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Ssh2Session, &str) -> Result<T, EngineError> + Send + 'static,
    {
        if self.link.is_severed() {
            return Err(transport(&self.host_name, "session unusable", "connection severed"));
        }

        let session = self.session.clone();
        let host_name = self.host_name.clone();
        let guard = SeverOnDrop::new(&self.link);

        let res = tokio::task::spawn_blocking(move || op(&session, &host_name)).await;
        guard.disarm();

        res.map_err(|e| transport(&self.host_name, "SSH task failed", e))?
    }
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, EngineError> {
        self.exec_capped(cmd, usize::MAX).await
    }

    async fn exec_capped(&self, cmd: &str, limit: usize) -> Result<CommandResult, EngineError> {
        // libssh2 is blocking; keep it off the async workers
        let command = cmd.to_string();
        self.blocking(move |session, host| Self::exec_blocking(session, host, &command, limit))
            .await
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), EngineError> {
        debug!(host = %self.host_name, path, bytes = contents.len(), "uploading over SFTP");
        let path = path.to_string();
        let contents = contents.to_vec();
        self.blocking(move |session, host| {
            Self::write_blocking(session, host, &path, &contents, mode)
        })
        .await
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, EngineError> {
        debug!(host = %self.host_name, path, "downloading over SFTP");
        let path = path.to_string();
        self.blocking(move |session, host| Self::read_blocking(session, host, &path))
            .await
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn is_alive(&self) -> bool {
        !self.link.is_severed() && self.session.authenticated()
    }

    async fn close(&self) {
        // A severed link has nothing left to say goodbye on, and a reader
        // may still hold the session lock
        if self.link.is_severed() {
            return;
        }

        let session = self.session.clone();
        let link = self.link.clone();
        let host_name = self.host_name.clone();
        let disconnect = tokio::task::spawn_blocking(move || {
            session.set_timeout(CLOSE_TIMEOUT.as_millis() as u32);
            let res = session.disconnect(None, "catalyst: session closed", None);
            link.sever();
            res
        });

        match tokio::time::timeout(CLOSE_TIMEOUT, disconnect).await {
            Ok(Ok(Err(e))) => warn!(host = %host_name, error = %e, "SSH disconnect failed"),
            Ok(_) => {}
            Err(_) => {
                warn!(host = %host_name, "SSH disconnect stalled, dropping connection");
                self.link.sever();
            }
        }
    }
}

fn ssh_connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("Ensure SSH service is running on the target host".to_string())
        }
        std::io::ErrorKind::TimedOut => {
            Some("Check network connectivity and firewall rules".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            Some("Check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

/// Simple home directory lookup
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

/// Helper for keyboard-interactive authentication
struct PasswordPrompter(String);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}
