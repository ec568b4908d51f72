//! Seam to console-user resolution.
//!
//! The control socket is a security boundary: only the user at the console
//! may talk to the daemon. Resolution of who that user is belongs to the
//! host environment; the default implementation reports the owner of a
//! console device node.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use tracing::debug;

/// Default console device whose owner is treated as the console user.
pub const DEFAULT_CONSOLE_DEVICE: &str = "/dev/console";

/// Resolves the uid of the user currently at the console.
pub trait ConsoleOwnerResolver: Send + Sync {
    /// Returns the console user's uid, or `None` if no user is resolvable.
    fn current_console_owner(&self) -> Option<u32>;
}

/// Resolver that stats a console device node and reports its owning uid.
#[derive(Debug, Clone)]
pub struct ConsoleDeviceOwner {
    device: PathBuf,
}

impl ConsoleDeviceOwner {
    /// Creates a resolver for the given device node.
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl Default for ConsoleDeviceOwner {
    fn default() -> Self {
        Self::new(DEFAULT_CONSOLE_DEVICE)
    }
}

impl ConsoleOwnerResolver for ConsoleDeviceOwner {
    fn current_console_owner(&self) -> Option<u32> {
        match fs::metadata(&self.device) {
            Ok(meta) => Some(meta.uid()),
            Err(e) => {
                debug!(
                    device = %self.device.display(),
                    error = %e,
                    "could not stat console device"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_of_created_file_is_current_uid() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let device = dir.path().join("console");
        fs::write(&device, b"").expect("create fake device");

        let resolver = ConsoleDeviceOwner::new(&device);
        let uid = resolver.current_console_owner();

        // SAFETY: getuid is always safe to call.
        let expected = unsafe { libc::getuid() };
        assert_eq!(uid, Some(expected));
    }

    #[test]
    fn test_missing_device_resolves_to_none() {
        let resolver = ConsoleDeviceOwner::new("/nonexistent/console-device");
        assert_eq!(resolver.current_console_owner(), None);
    }
}
