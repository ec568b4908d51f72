//! Client session state machine.
//!
//! `ClientSession` owns the daemon's single piece of mutable state: whether
//! a client currently holds the capture resource. It is only ever touched
//! from the server's dispatch task, so its methods are plain `&mut self`
//! calls with no internal locking.
//!
//! Every transition into `Active` gets a fresh generation number. Exit
//! events carry the generation of the registration that produced them, and
//! an event whose generation no longer matches the current state is stale
//! and discarded. This is what makes watcher cancellation races harmless.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capture::{CaptureBackend, CaptureSession};
use crate::watcher::{ExitEvent, ExitWatcher, WatcherHandle};

/// Current lifecycle state.
enum SessionState {
    /// No client holds the capture resource.
    Idle,

    /// One client holds the capture resource.
    Active {
        client_pid: u32,
        generation: u64,
        capture: Box<dyn CaptureSession>,
        /// `None` when watcher registration failed: the session then runs
        /// unwatched, a deliberate compatibility choice (a later exit of the
        /// client goes unnoticed until the next connect or daemon stop).
        watcher: Option<WatcherHandle>,
    },
}

/// The Idle/Active state machine binding one client to one capture instance.
pub struct ClientSession {
    state: SessionState,
    generation: u64,
    backend: Arc<dyn CaptureBackend>,
    watcher: ExitWatcher,
}

impl ClientSession {
    /// Creates an idle session.
    pub fn new(backend: Arc<dyn CaptureBackend>, watcher: ExitWatcher) -> Self {
        Self {
            state: SessionState::Idle,
            generation: 0,
            backend,
            watcher,
        }
    }

    /// Handles a `Connect` message.
    ///
    /// Any prior session is torn down synchronously before the new capture
    /// instance is created: two capture instances never coexist. Watcher
    /// registration failure is logged and leaves the new session active but
    /// unwatched.
    pub fn connect(&mut self, client_pid: u32) {
        self.teardown_active("superseded by new connect");

        self.generation += 1;
        let generation = self.generation;
        let capture = self.backend.create();

        let watcher = match self.watcher.register(client_pid, generation) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(
                    pid = client_pid,
                    generation,
                    error = %e,
                    "exit watcher registration failed; session will be unwatched"
                );
                None
            }
        };

        info!(pid = client_pid, generation, "control client connected");

        self.state = SessionState::Active {
            client_pid,
            generation,
            capture,
            watcher,
        };
    }

    /// Handles an exit event marshalled from a watcher task.
    ///
    /// Only an event whose generation matches the current Active state
    /// releases the session; anything else is stale and discarded silently.
    pub fn client_exited(&mut self, event: ExitEvent) {
        let current = matches!(
            &self.state,
            SessionState::Active { generation, .. } if *generation == event.generation
        );

        if current {
            info!(pid = event.pid, generation = event.generation, "control client exited");
            self.teardown_active("client exited");
        } else {
            debug!(
                pid = event.pid,
                generation = event.generation,
                "discarding stale exit event"
            );
        }
    }

    /// Handles a `DefineSimpleModifications` message.
    ///
    /// Forwards the payload verbatim to the bound capture instance. With no
    /// active session this is a documented no-op, not an error.
    pub fn define_simple_modifications(&mut self, payload: &[u8]) {
        match &mut self.state {
            SessionState::Active { capture, client_pid, .. } => {
                debug!(pid = *client_pid, len = payload.len(), "forwarding capture configuration");
                capture.configure(payload);
            }
            SessionState::Idle => {
                debug!(
                    len = payload.len(),
                    "no active session, dropping capture configuration"
                );
            }
        }
    }

    /// Releases all session resources unconditionally. Called at daemon stop
    /// regardless of current state; the session remains usable afterwards.
    pub fn teardown(&mut self) {
        self.teardown_active("daemon stopping");
    }

    /// Cancels the watcher registration and drops the capture instance, if
    /// any, then returns to Idle.
    fn teardown_active(&mut self, reason: &str) {
        if let SessionState::Active {
            client_pid,
            generation,
            watcher,
            ..
        } = std::mem::replace(&mut self.state, SessionState::Idle)
        {
            if let Some(handle) = &watcher {
                handle.cancel();
            }
            debug!(pid = client_pid, generation, reason, "capture session torn down");
            // `capture` and `watcher` drop here, releasing the capture
            // resource and stopping the polling task.
        }
    }

    /// Whether a client currently holds the capture resource.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    /// Pid of the active client, if any.
    pub fn active_pid(&self) -> Option<u32> {
        match &self.state {
            SessionState::Active { client_pid, .. } => Some(*client_pid),
            SessionState::Idle => None,
        }
    }

    /// Generation assigned to the most recent Active transition.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// What the recording backend observed, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum CaptureCall {
        Created(u32),
        Configured(u32, Vec<u8>),
        Released(u32),
    }

    /// Capture backend that records every call for assertions.
    #[derive(Clone, Default)]
    struct RecordingBackend {
        next_id: Arc<AtomicU32>,
        calls: Arc<Mutex<Vec<CaptureCall>>>,
    }

    impl RecordingBackend {
        fn calls(&self) -> Vec<CaptureCall> {
            self.calls.lock().unwrap().clone()
        }

        fn released_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, CaptureCall::Released(_)))
                .count()
        }
    }

    impl CaptureBackend for RecordingBackend {
        fn create(&self) -> Box<dyn CaptureSession> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.calls.lock().unwrap().push(CaptureCall::Created(id));
            Box::new(RecordingSession {
                id,
                calls: Arc::clone(&self.calls),
            })
        }
    }

    struct RecordingSession {
        id: u32,
        calls: Arc<Mutex<Vec<CaptureCall>>>,
    }

    impl CaptureSession for RecordingSession {
        fn configure(&mut self, payload: &[u8]) {
            self.calls
                .lock()
                .unwrap()
                .push(CaptureCall::Configured(self.id, payload.to_vec()));
        }
    }

    impl Drop for RecordingSession {
        fn drop(&mut self) {
            self.calls.lock().unwrap().push(CaptureCall::Released(self.id));
        }
    }

    fn create_session() -> (ClientSession, RecordingBackend, mpsc::Receiver<ExitEvent>) {
        let backend = RecordingBackend::default();
        let (tx, rx) = mpsc::channel(16);
        let session = ClientSession::new(Arc::new(backend.clone()), ExitWatcher::new(tx));
        (session, backend, rx)
    }

    #[tokio::test]
    async fn test_connect_from_idle() {
        let (mut session, backend, _rx) = create_session();

        session.connect(7);

        assert!(session.is_active());
        assert_eq!(session.active_pid(), Some(7));
        assert_eq!(session.generation(), 1);
        assert_eq!(backend.calls(), vec![CaptureCall::Created(1)]);
    }

    #[tokio::test]
    async fn test_reconnect_tears_down_prior_session_first() {
        let (mut session, backend, _rx) = create_session();

        session.connect(7);
        session.connect(9);

        assert_eq!(session.active_pid(), Some(9));
        assert_eq!(session.generation(), 2);
        // Instance 1 must be released before instance 2 exists.
        assert_eq!(
            backend.calls(),
            vec![
                CaptureCall::Created(1),
                CaptureCall::Released(1),
                CaptureCall::Created(2),
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_exit_event_is_discarded() {
        let (mut session, backend, _rx) = create_session();

        session.connect(7);
        session.connect(9);

        // Exit event from the superseded pid-7 registration.
        session.client_exited(ExitEvent { pid: 7, generation: 1 });

        assert!(session.is_active());
        assert_eq!(session.active_pid(), Some(9));
        assert_eq!(backend.released_count(), 1);
    }

    #[tokio::test]
    async fn test_matching_exit_event_releases_exactly_once() {
        let (mut session, backend, _rx) = create_session();

        session.connect(7);
        session.client_exited(ExitEvent { pid: 7, generation: 1 });

        assert!(!session.is_active());
        assert_eq!(backend.released_count(), 1);

        // Duplicate delivery of the same event is a no-op.
        session.client_exited(ExitEvent { pid: 7, generation: 1 });
        assert!(!session.is_active());
        assert_eq!(backend.released_count(), 1);
    }

    #[tokio::test]
    async fn test_define_while_idle_is_a_no_op() {
        let (mut session, backend, _rx) = create_session();

        session.define_simple_modifications(b"ignored");

        assert!(!session.is_active());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_define_while_active_forwards_exact_payload() {
        let (mut session, backend, _rx) = create_session();

        session.connect(7);
        let payload = vec![0x01, 0x02, 0xfe, 0xff];
        session.define_simple_modifications(&payload);

        assert!(backend
            .calls()
            .contains(&CaptureCall::Configured(1, payload)));
    }

    #[tokio::test]
    async fn test_connect_survives_watcher_registration_failure() {
        let backend = RecordingBackend::default();
        let (tx, rx) = mpsc::channel(16);
        drop(rx); // Closed channel: registration cannot succeed.
        let mut session = ClientSession::new(Arc::new(backend.clone()), ExitWatcher::new(tx));

        session.connect(7);

        // The session proceeds active but unwatched.
        assert!(session.is_active());
        assert_eq!(session.active_pid(), Some(7));
        assert_eq!(backend.calls(), vec![CaptureCall::Created(1)]);
    }

    #[tokio::test]
    async fn test_teardown_releases_active_session() {
        let (mut session, backend, _rx) = create_session();

        session.connect(7);
        session.teardown();

        assert!(!session.is_active());
        assert_eq!(backend.released_count(), 1);
    }

    #[tokio::test]
    async fn test_teardown_while_idle_is_safe() {
        let (mut session, backend, _rx) = create_session();

        session.teardown();

        assert!(!session.is_active());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_generation_is_monotonic_across_reconnects() {
        let (mut session, _backend, _rx) = create_session();

        session.connect(7);
        session.client_exited(ExitEvent { pid: 7, generation: 1 });
        session.connect(7);

        // A returning client gets a new generation, never a reused one.
        assert_eq!(session.generation(), 2);
    }
}
