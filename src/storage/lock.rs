//! # Byte-Range File Locks
//!
//! Cross-process coordination on the group index uses POSIX advisory record
//! locks (`fcntl` with `F_SETLK`/`F_SETLKW`) over two kinds of ranges:
//!
//! ```text
//! group.index
//! +---------------------------+  offset 0
//! | header + bucket table     |  <- header lock: structural changes
//! +---------------------------+  GROUP_HEADER_SIZE
//! | entry 0                   |  <- group lock: pack/rebuild/append of
//! | entry 1                   |     exactly one group's entry bytes
//! | ...                       |
//! +---------------------------+
//! ```
//!
//! [`RangeLock`] is an RAII guard: the range is unlocked when it drops.
//!
//! ## Caveats
//!
//! Record locks belong to the process, not the thread or descriptor. Two
//! threads of one process never exclude each other through these locks, so
//! in-process callers serialize with their own mutex (the façade does). Taking
//! a read lock over a range this process already write-locks converts the
//! lock rather than blocking.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

#[derive(Debug)]
pub struct RangeLock {
    file: Arc<File>,
    offset: u64,
    len: u64,
}

impl RangeLock {
    /// Blocks until the range is locked.
    pub fn acquire(file: &Arc<File>, kind: LockKind, offset: u64, len: u64) -> io::Result<Self> {
        set_lock(file, Some(kind), offset, len, true)?;
        Ok(Self {
            file: Arc::clone(file),
            offset,
            len,
        })
    }

    /// Fails with `ErrorKind::WouldBlock` instead of waiting.
    pub fn try_acquire(
        file: &Arc<File>,
        kind: LockKind,
        offset: u64,
        len: u64,
    ) -> io::Result<Self> {
        set_lock(file, Some(kind), offset, len, false)?;
        Ok(Self {
            file: Arc::clone(file),
            offset,
            len,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        if let Err(e) = set_lock(&self.file, None, self.offset, self.len, false) {
            warn!(offset = self.offset, len = self.len, error = %e, "failed to release range lock");
        }
    }
}

fn set_lock(file: &File, kind: Option<LockKind>, offset: u64, len: u64, wait: bool) -> io::Result<()> {
    let l_type = match kind {
        Some(LockKind::Read) => libc::F_RDLCK,
        Some(LockKind::Write) => libc::F_WRLCK,
        None => libc::F_UNLCK,
    };

    // SAFETY: flock is a plain C struct; all-zero is a valid bit pattern and
    // the fields we rely on are set explicitly below.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;

    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the
        // duration of the call; `fl` is a valid, initialized flock.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl as *const libc::flock) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EACCES) if !wait => {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("range {}+{} is locked by another process", offset, len),
                ));
            }
            _ => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn open_file(dir: &std::path::Path) -> Arc<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("lockfile"))
            .unwrap();
        file.set_len(4096).unwrap();
        Arc::new(file)
    }

    #[test]
    fn write_lock_acquires_and_releases() {
        let dir = tempdir().unwrap();
        let file = open_file(dir.path());

        let lock = RangeLock::acquire(&file, LockKind::Write, 0, 128).unwrap();
        assert_eq!(lock.offset(), 0);
        assert_eq!(lock.len(), 128);
        drop(lock);

        RangeLock::try_acquire(&file, LockKind::Write, 0, 128).unwrap();
    }

    #[test]
    fn same_process_can_relock_its_own_range() {
        let dir = tempdir().unwrap();
        let file = open_file(dir.path());

        let _write = RangeLock::acquire(&file, LockKind::Write, 100, 96).unwrap();
        let read = RangeLock::try_acquire(&file, LockKind::Read, 100, 96);

        assert!(read.is_ok());
    }

    #[test]
    fn read_locks_on_disjoint_ranges_coexist() {
        let dir = tempdir().unwrap();
        let file = open_file(dir.path());

        let _a = RangeLock::acquire(&file, LockKind::Read, 0, 10).unwrap();
        let _b = RangeLock::acquire(&file, LockKind::Read, 10, 10).unwrap();
    }
}
