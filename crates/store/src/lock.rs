//! Lock tokens guarding artifact construction
//!
//! A lock token is a short marker file colocated with the artifact it
//! guards. Its presence signals "under construction elsewhere"; absence is
//! the only valid precondition for acquiring it, and deletion is the only
//! way to release it. Observers poll with a fixed backoff.
//!
//! There is deliberately no timeout or automatic release: a crashed holder
//! leaves its token behind and must be cleared by external intervention
//! (kill the process, remove the file). Silently expiring a token could let
//! two creators race on the same artifact.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use quarry_core::Result;
use tracing::info;

/// File name of the token, placed next to the guarded artifact
pub const LOCK_FILE_NAME: &str = "lock";

/// Fixed backoff between polls of a held token
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Content written into the token file; aids debugging a stale lock
const LOCK_CONTENT: &[u8] = b"artifact under construction\n";

/// A held lock token
///
/// Acquired by [`BuildLock::acquire`], released by [`BuildLock::release`].
/// Dropping a `BuildLock` without releasing leaves the token on disk,
/// mirroring what a crashed holder leaves behind.
#[derive(Debug)]
#[must_use = "a build lock must be released, or the token file stays behind"]
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    /// Token path for a directory of artifacts
    pub fn token_path(dir: &Path) -> PathBuf {
        dir.join(LOCK_FILE_NAME)
    }

    /// Block until no token exists under `dir`, then write one and return
    /// the held lock.
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = Self::token_path(dir);
        Self::wait_clear(dir);
        fs::write(&path, LOCK_CONTENT)?;
        Ok(BuildLock { path })
    }

    /// Block until no token exists under `dir`, without acquiring one.
    ///
    /// Used by workers that only need construction elsewhere to finish
    /// before proceeding.
    pub fn wait_clear(dir: &Path) {
        let path = Self::token_path(dir);
        let mut waited = false;
        while path.exists() {
            if !waited {
                info!(path = %path.display(), "found lock, waiting for other programs...");
                waited = true;
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Delete the token, releasing the lock
    pub fn release(self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Path of the token file held by this lock
    pub fn path(&self) -> &Path {
        &self.path
    }
}
