//! Control server: socket lifecycle and the single dispatch task.
//!
//! `ControlServer` owns the listening unix datagram socket and the one task
//! on which every session transition runs. The dispatch loop multiplexes
//! three sources: shutdown (cancellation token), exit events marshalled
//! from watcher tasks, and inbound datagrams. Socket receives are bounded
//! by a timeout so a quiet socket can never wedge the loop.
//!
//! `start` binds the socket and spawns the loop; `stop` removes the socket
//! so no further client can connect, cancels the token and awaits the loop,
//! which unconditionally tears down any remaining session on its way out.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use grabd_protocol::{decode, ControlMessage};

use crate::capture::CaptureBackend;
use crate::console::ConsoleOwnerResolver;
use crate::session::ClientSession;
use crate::watcher::{ExitEvent, ExitWatcher, DEFAULT_POLL_INTERVAL};

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/grabd.sock";

/// Receive buffer size. Large enough for the biggest configuration payload
/// a single datagram can carry on common unix domain socket limits.
const RECV_BUFFER_LEN: usize = 64 * 1024;

/// Upper bound on one socket receive; the loop re-checks its other sources
/// at least this often even if the select sources never wake.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffer for exit events marshalled from watcher tasks.
const EXIT_EVENT_BUFFER: usize = 16;

/// Errors that are fatal to `start`.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The control socket could not be created at the configured path.
    #[error("failed to bind control socket at {path}: {source}")]
    BindFailed {
        /// Configured socket path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `start` was called while the dispatch task is already running.
    #[error("control server is already running")]
    AlreadyRunning,
}

/// The grabd control server.
pub struct ControlServer {
    socket_path: PathBuf,
    backend: Arc<dyn CaptureBackend>,
    console: Arc<dyn ConsoleOwnerResolver>,
    watcher_poll_interval: Duration,
    cancel_token: CancellationToken,
    dispatch: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Creates a stopped server.
    pub fn new(
        socket_path: impl Into<PathBuf>,
        backend: Arc<dyn CaptureBackend>,
        console: Arc<dyn ConsoleOwnerResolver>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            backend,
            console,
            watcher_poll_interval: DEFAULT_POLL_INTERVAL,
            cancel_token: CancellationToken::new(),
            dispatch: None,
        }
    }

    /// Overrides how often exit watchers sample `/proc`.
    pub fn with_watcher_poll_interval(mut self, interval: Duration) -> Self {
        self.watcher_poll_interval = interval;
        self
    }

    /// Returns the control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the control socket, applies restrictive ownership and
    /// permissions, and spawns the dispatch task.
    ///
    /// Must be called from within a tokio runtime. A stale socket file left
    /// by a previous run is removed first. Bind failure is fatal and
    /// propagated; it is never retried here.
    ///
    /// # Errors
    ///
    /// - `StartupError::AlreadyRunning` if the dispatch task is running
    /// - `StartupError::BindFailed` if the socket cannot be created
    pub fn start(&mut self) -> Result<(), StartupError> {
        if self.dispatch.is_some() {
            return Err(StartupError::AlreadyRunning);
        }

        // Remove a stale socket from a previous run.
        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path).map_err(|e| StartupError::BindFailed {
                path: self.socket_path.clone(),
                source: e,
            })?;
        }

        let socket = UnixDatagram::bind(&self.socket_path).map_err(|e| StartupError::BindFailed {
            path: self.socket_path.clone(),
            source: e,
        })?;

        self.apply_socket_permissions();

        let (exit_tx, exit_rx) = mpsc::channel(EXIT_EVENT_BUFFER);
        let watcher = ExitWatcher::with_poll_interval(exit_tx, self.watcher_poll_interval);
        let session = ClientSession::new(Arc::clone(&self.backend), watcher);

        self.cancel_token = CancellationToken::new();
        let cancel = self.cancel_token.clone();
        let socket_path = self.socket_path.clone();

        self.dispatch = Some(tokio::spawn(dispatch_loop(
            socket,
            socket_path,
            session,
            exit_rx,
            cancel,
        )));

        info!(socket = %self.socket_path.display(), "control server listening");
        Ok(())
    }

    /// Stops the server: removes the socket so no further client can
    /// connect, then waits for the dispatch task to tear down any remaining
    /// session and exit. Idempotent.
    pub async fn stop(&mut self) {
        if let Err(e) = fs::remove_file(&self.socket_path) {
            debug!(
                socket = %self.socket_path.display(),
                error = %e,
                "control socket already removed"
            );
        }

        self.cancel_token.cancel();

        if let Some(handle) = self.dispatch.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch task ended abnormally");
            }
        }

        info!("control server stopped");
    }

    /// Restricts the socket to the console user: owned by them, mode 0600.
    ///
    /// Matches the original daemon's policy: failures here are logged, not
    /// fatal.
    fn apply_socket_permissions(&self) {
        match self.console.current_console_owner() {
            Some(uid) => {
                if let Err(e) = std::os::unix::fs::chown(&self.socket_path, Some(uid), Some(0)) {
                    warn!(
                        socket = %self.socket_path.display(),
                        uid,
                        error = %e,
                        "failed to chown control socket"
                    );
                }
            }
            None => {
                warn!(
                    socket = %self.socket_path.display(),
                    "console owner unresolved; leaving socket owned by daemon user"
                );
            }
        }

        if let Err(e) =
            fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o600))
        {
            warn!(
                socket = %self.socket_path.display(),
                error = %e,
                "failed to restrict control socket permissions"
            );
        }
    }
}

/// The single serialization point: every session transition happens here.
async fn dispatch_loop(
    socket: UnixDatagram,
    socket_path: PathBuf,
    mut session: ClientSession,
    mut exit_rx: mpsc::Receiver<ExitEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    debug!("dispatch loop started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("dispatch loop shutdown requested");
                break;
            }

            event = exit_rx.recv() => {
                // The session holds a sender, so the channel outlives us;
                // None is unreachable while the loop runs.
                if let Some(event) = event {
                    session.client_exited(event);
                }
            }

            received = timeout(RECV_TIMEOUT, socket.recv(&mut buf)) => {
                match received {
                    Ok(Ok(len)) => dispatch_datagram(&mut session, &buf[..len]),
                    Ok(Err(e)) => warn!(error = %e, "control socket receive failed"),
                    // Quiet socket: loop around and re-check the other sources.
                    Err(_elapsed) => {}
                }
            }
        }
    }

    // Unconditional teardown: whatever state we stopped in, the capture
    // instance is released and the watcher cancelled exactly once.
    session.teardown();

    if socket_path.exists() {
        if let Err(e) = fs::remove_file(&socket_path) {
            warn!(
                socket = %socket_path.display(),
                error = %e,
                "failed to remove control socket"
            );
        }
    }

    debug!("dispatch loop stopped");
}

/// Decodes one datagram and applies it to the session. Decode failures are
/// logged and dropped; they never abort the loop.
fn dispatch_datagram(session: &mut ClientSession, bytes: &[u8]) {
    match decode(bytes) {
        Ok(ControlMessage::Connect { client_pid }) => session.connect(client_pid),
        Ok(ControlMessage::DefineSimpleModifications { payload }) => {
            session.define_simple_modifications(&payload);
        }
        Err(e) => {
            warn!(error = %e, len = bytes.len(), "dropping undecodable control message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::NullCaptureBackend;
    use crate::console::ConsoleDeviceOwner;

    fn create_server(path: impl Into<PathBuf>) -> ControlServer {
        ControlServer::new(
            path,
            Arc::new(NullCaptureBackend),
            Arc::new(ConsoleDeviceOwner::default()),
        )
    }

    #[test]
    fn test_default_socket_path() {
        assert_eq!(DEFAULT_SOCKET_PATH, "/tmp/grabd.sock");
    }

    #[tokio::test]
    async fn test_start_fails_on_unbindable_path() {
        let mut server = create_server("/nonexistent-grabd-dir/control.sock");

        let err = server.start().unwrap_err();
        assert!(matches!(err, StartupError::BindFailed { .. }));
        assert!(err.to_string().contains("/nonexistent-grabd-dir"));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut server = create_server(dir.path().join("control.sock"));

        server.start().expect("first start");
        let err = server.start().unwrap_err();
        assert!(matches!(err, StartupError::AlreadyRunning));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut server = create_server(dir.path().join("control.sock"));

        server.start().expect("start");
        server.stop().await;
        server.stop().await;

        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn test_stop_removes_socket_and_allows_restart() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut server = create_server(dir.path().join("control.sock"));

        server.start().expect("start");
        assert!(server.socket_path().exists());

        server.stop().await;
        assert!(!server.socket_path().exists());

        server.start().expect("restart");
        assert!(server.socket_path().exists());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_socket_mode_is_owner_only() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut server = create_server(dir.path().join("control.sock"));

        server.start().expect("start");
        let mode = fs::metadata(server.socket_path())
            .expect("stat socket")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        server.stop().await;
    }
}
