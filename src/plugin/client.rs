//! Owner of one plugin subprocess: spawn, handshake, connection, and
//! idempotent termination.
//!
//! Lifecycle: `Created → Connected → Exited`. The spawn/handshake and the
//! close sequence happen while the state lock is held, so the intermediate
//! Starting/Closing states are never observable. `kill` is valid from any
//! state, repeatable, and safe to call from a different task than the one
//! that started the client (cleanup may run from an interrupt path).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CoreError, LaunchErrorKind};
use crate::plugin::connection::Connection;
use crate::plugin::protocol::{HandshakeInfo, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};

/// How long a plugin gets to write its handshake line.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a plugin gets to exit after its connection is closed before it
/// is killed outright.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

enum State {
    Created,
    Connected {
        child: Child,
        connection: Arc<Connection>,
        address: String,
    },
    Exited {
        status: Option<i32>,
    },
}

pub struct PluginClient {
    id: u64,
    path: PathBuf,
    handshake_timeout: Duration,
    state: Mutex<State>,
}

impl PluginClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PluginClient {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            path: path.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            state: Mutex::new(State::Created),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Stable identifier used as the cleanup-set key.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawn the subprocess, run the handshake, and dial the announced
    /// address. Idempotent while Connected. On any failure the subprocess
    /// is killed and the client lands in Exited, so nothing leaks.
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Connected { .. } => return Ok(()),
            State::Exited { .. } => {
                return Err(CoreError::comm(format!(
                    "plugin {} already exited",
                    self.path.display()
                )));
            }
            State::Created => {}
        }

        match self.launch().await {
            Ok(connected) => {
                *state = connected;
                Ok(())
            }
            Err((err, child)) => {
                let status = match child {
                    Some(child) => reap(child).await,
                    None => None,
                };
                *state = State::Exited { status };
                Err(err)
            }
        }
    }

    async fn launch(&self) -> Result<State, (CoreError, Option<Child>)> {
        let mut child = Command::new(&self.path)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    LaunchErrorKind::NotFound
                } else {
                    LaunchErrorKind::Connect
                };
                (CoreError::launch(kind, &self.path, e.to_string()), None)
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        // Anything the plugin writes to stderr is its own logging, never
        // protocol data. Forward it to ours.
        let log_name = self.path.display().to_string();
        tokio::spawn(forward_log_lines(BufReader::new(stderr), log_name.clone()));

        let mut stdout = BufReader::new(stdout);
        let mut line = String::new();
        let read = tokio::time::timeout(self.handshake_timeout, stdout.read_line(&mut line)).await;
        let handshake = match read {
            Err(_) => Err(CoreError::launch(
                LaunchErrorKind::Timeout,
                &self.path,
                format!(
                    "no handshake line within {:?}",
                    self.handshake_timeout
                ),
            )),
            Ok(Err(e)) => Err(CoreError::launch(
                LaunchErrorKind::Protocol,
                &self.path,
                format!("failed reading handshake line: {e}"),
            )),
            Ok(Ok(0)) => Err(CoreError::launch(
                LaunchErrorKind::Protocol,
                &self.path,
                "plugin exited before writing a handshake line".to_string(),
            )),
            Ok(Ok(_)) => HandshakeInfo::parse(&line).map_err(|e| self.relocate(e)),
        };
        let handshake = match handshake {
            Ok(h) => h,
            Err(e) => return Err((e, Some(child))),
        };

        // Any further stdout is diagnostic text from the plugin.
        tokio::spawn(forward_log_lines(stdout, log_name));

        debug!(
            plugin = %self.path.display(),
            address = %handshake.address,
            "plugin handshake complete"
        );

        let stream = match TcpStream::connect(&handshake.address).await {
            Ok(s) => s,
            Err(e) => {
                return Err((
                    CoreError::launch(
                        LaunchErrorKind::Connect,
                        &self.path,
                        format!("failed to dial {}: {e}", handshake.address),
                    ),
                    Some(child),
                ));
            }
        };

        Ok(State::Connected {
            child,
            connection: Connection::new(stream),
            address: handshake.address,
        })
    }

    /// The live RPC connection. Fails once the client has exited.
    pub async fn connection(&self) -> Result<Arc<Connection>, CoreError> {
        match &*self.state.lock().await {
            State::Connected { connection, .. } => Ok(Arc::clone(connection)),
            State::Created => Err(CoreError::comm(format!(
                "plugin {} was never started",
                self.path.display()
            ))),
            State::Exited { status } => Err(CoreError::PluginCommunication {
                context: format!("plugin {} has exited", self.path.display()),
                exit: *status,
            }),
        }
    }

    /// The transport address negotiated at handshake, while connected.
    pub async fn address(&self) -> Option<String> {
        match &*self.state.lock().await {
            State::Connected { address, .. } => Some(address.clone()),
            _ => None,
        }
    }

    /// Graceful close: half-close the connection, give the plugin a bounded
    /// window to exit, then kill it. Equivalent to [`PluginClient::kill`].
    pub async fn close(&self) {
        self.kill().await;
    }

    /// Terminate the subprocess. Idempotent and never blocks indefinitely.
    pub async fn kill(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, State::Exited { status: None });
        let status = match previous {
            State::Created => None,
            State::Exited { status } => status,
            State::Connected {
                mut child,
                connection,
                ..
            } => {
                connection.close().await;
                match tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    Ok(Err(e)) => {
                        warn!(plugin = %self.path.display(), "wait failed: {e}");
                        None
                    }
                    Err(_) => {
                        debug!(
                            plugin = %self.path.display(),
                            "no exit within grace period, killing"
                        );
                        reap(child).await
                    }
                }
            }
        };
        *state = State::Exited { status };
    }

    /// Subprocess exit status, once known. Retained after Exited for
    /// diagnostic reporting.
    pub async fn exit_status(&self) -> Option<i32> {
        match &*self.state.lock().await {
            State::Exited { status } => *status,
            _ => None,
        }
    }

    /// True once the client is in its terminal state.
    pub async fn exited(&self) -> bool {
        matches!(&*self.state.lock().await, State::Exited { .. })
    }

    /// Handshake parse errors are produced without knowledge of the
    /// executable path; fill it in.
    fn relocate(&self, err: CoreError) -> CoreError {
        match err {
            CoreError::PluginLaunch { kind, message, .. } => {
                CoreError::launch(kind, &self.path, message)
            }
            other => other,
        }
    }
}

async fn reap(mut child: Child) -> Option<i32> {
    let _ = child.start_kill();
    match tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        _ => None,
    }
}

async fn forward_log_lines<R>(reader: BufReader<R>, plugin: String)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "kiln::plugin", %plugin, "{line}");
    }
}
