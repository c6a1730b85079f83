//! Named cross-process lock.
//!
//! An exclusive `flock` over a lock file that lives beside the segment
//! files. The kernel drops the lock when the holder exits, so a crashed
//! process can never wedge port creation the way an in-segment mutex could.
//! Held only for the duration of `open_port`.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use nix::fcntl::{Flock, FlockArg};

use super::segment_dir;

/// Guard for a held named lock. Releases the `flock` on drop; the lock file
/// itself stays behind until [`NamedLock::remove`].
pub struct NamedLockGuard {
    _lock: Flock<File>,
}

/// Factory for named cross-process locks.
pub struct NamedLock;

impl NamedLock {
    /// Opens or creates the lock file `name` and takes an exclusive lock,
    /// blocking until the current holder (if any) releases it.
    pub fn acquire(name: &str) -> io::Result<NamedLockGuard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666) // Lockable by all users, like the segments it guards
            .open(Self::path(name))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from_raw_os_error(errno as i32))?;

        Ok(NamedLockGuard { _lock: lock })
    }

    /// Unlinks the lock file `name`.
    pub fn remove(name: &str) -> io::Result<()> {
        fs::remove_file(Self::path(name))
    }

    fn path(name: &str) -> PathBuf {
        segment_dir().join(name)
    }
}
