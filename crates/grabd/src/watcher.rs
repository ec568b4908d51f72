//! Client process exit notifications.
//!
//! The `ExitWatcher` turns "this pid has terminated" into an [`ExitEvent`]
//! delivered over an mpsc channel. Each registration runs its own polling
//! task against `/proc` and fires at most once; the consumer (the server's
//! dispatch loop) is the only place that acts on the event, so watcher tasks
//! never mutate session state themselves.
//!
//! Cancellation is best-effort: an event already in flight when the handle
//! is cancelled is delivered anyway and discarded downstream by the
//! session's generation check.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often a watcher task samples `/proc` for its pid.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Notification that a watched client process has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    /// Pid of the terminated client.
    pub pid: u32,

    /// Generation of the capture session the registration belonged to.
    /// Used by the consumer to discard stale events.
    pub generation: u64,
}

/// Errors from registering an exit watcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatcherError {
    /// The exit event channel is closed; no registration can be delivered.
    #[error("exit event channel closed")]
    ChannelClosed,
}

/// Handle to one watcher registration.
///
/// Cancelling (or dropping) the handle stops the polling task. At most one
/// event may still be in flight afterwards.
#[derive(Debug)]
pub struct WatcherHandle {
    cancel: CancellationToken,
}

impl WatcherHandle {
    /// Stops the polling task. Safe to call with an event already in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Registers polling tasks that watch client pids for termination.
#[derive(Debug, Clone)]
pub struct ExitWatcher {
    events: mpsc::Sender<ExitEvent>,
    poll_interval: Duration,
}

impl ExitWatcher {
    /// Creates a watcher delivering events into `events`.
    pub fn new(events: mpsc::Sender<ExitEvent>) -> Self {
        Self::with_poll_interval(events, DEFAULT_POLL_INTERVAL)
    }

    /// Creates a watcher with a custom poll interval.
    pub fn with_poll_interval(events: mpsc::Sender<ExitEvent>, poll_interval: Duration) -> Self {
        Self {
            events,
            poll_interval,
        }
    }

    /// Starts watching `pid`, tagging the eventual exit event with
    /// `generation`.
    ///
    /// The process start time is recorded up front so that pid reuse is
    /// reported as an exit rather than as continued liveness. A pid that is
    /// already gone fires immediately.
    ///
    /// # Errors
    ///
    /// - `WatcherError::ChannelClosed` if the event channel has no receiver
    pub fn register(&self, pid: u32, generation: u64) -> Result<WatcherHandle, WatcherError> {
        if self.events.is_closed() {
            return Err(WatcherError::ChannelClosed);
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let events = self.events.clone();
        let poll_interval = self.poll_interval;
        let expected_start_time = process_start_time(pid);

        tokio::spawn(async move {
            loop {
                if has_exited(pid, expected_start_time) {
                    debug!(pid, generation, "watched client process exited");
                    let _ = events.send(ExitEvent { pid, generation }).await;
                    return;
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!(pid, generation, "exit watcher cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        debug!(pid, generation, "exit watcher registered");
        Ok(WatcherHandle { cancel })
    }
}

/// Reads the process start time from `/proc/<pid>/stat`.
fn process_start_time(pid: u32) -> Option<u64> {
    let process = procfs::process::Process::new(pid as i32).ok()?;
    process.stat().ok().map(|stat| stat.starttime)
}

/// Whether the watched process is gone, or its pid was reused.
fn has_exited(pid: u32, expected_start_time: Option<u64>) -> bool {
    let process = match procfs::process::Process::new(pid as i32) {
        Ok(p) => p,
        Err(_) => return true,
    };

    match (expected_start_time, process.stat()) {
        // Start time differs: the pid was recycled for another process.
        (Some(expected), Ok(stat)) => stat.starttime != expected,
        (Some(_), Err(_)) => true,
        // No baseline recorded; fall back to existence only.
        (None, _) => false,
    }
}
