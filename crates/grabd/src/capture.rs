//! Seam to the device-capture engine.
//!
//! The daemon arbitrates who owns the capture resource; the hardware side
//! lives behind these traits. A backend creates capture sessions, a session
//! accepts opaque configuration payloads and releases the underlying
//! resource when dropped.

use tracing::{debug, info};

/// Factory for capture sessions.
///
/// Creating a session claims the capture resource. The daemon guarantees it
/// never holds two sessions at once: the previous one is dropped before
/// `create` is called again.
pub trait CaptureBackend: Send + Sync {
    /// Claims the capture resource and returns a handle to it.
    fn create(&self) -> Box<dyn CaptureSession>;
}

/// A live capture session bound to one client.
///
/// Dropping the session releases the capture resource.
pub trait CaptureSession: Send {
    /// Applies an opaque configuration payload, forwarded verbatim from the
    /// control socket.
    fn configure(&mut self, payload: &[u8]);
}

/// Backend that claims nothing and logs what a real engine would do.
///
/// Used when grabd runs without capture hardware wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCaptureBackend;

impl CaptureBackend for NullCaptureBackend {
    fn create(&self) -> Box<dyn CaptureSession> {
        info!("capture session created (null backend)");
        Box::new(NullCaptureSession)
    }
}

struct NullCaptureSession;

impl CaptureSession for NullCaptureSession {
    fn configure(&mut self, payload: &[u8]) {
        debug!(len = payload.len(), "capture configuration applied (null backend)");
    }
}

impl Drop for NullCaptureSession {
    fn drop(&mut self) {
        info!("capture session released (null backend)");
    }
}
