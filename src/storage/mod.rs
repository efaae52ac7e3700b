//! # Storage Module
//!
//! Foundational pieces shared by the group index and the group data files:
//! the binary record layout, bounds-checked file regions, byte-range locks,
//! and the fixed-size identifiers (group hash, storage token).
//!
//! ## Directory Layout
//!
//! An overview directory holds one group index plus a tree of per-group
//! file pairs. Each group lives under one directory level per dot-separated
//! name component, named by that component's first character:
//!
//! ```text
//! overview_dir/
//! ├── group.index                    # hash table of GroupEntry records
//! ├── c/l/r/
//! │   ├── comp.lang.rust.IDX         # fixed-stride IndexEntry array
//! │   └── comp.lang.rust.DAT         # appended overview lines
//! └── n/a/n/
//!     ├── news.announce.newgroups.IDX
//!     └── news.announce.newgroups.DAT
//! ```
//!
//! ## Safety Model
//!
//! Files are shared between one writer process and many readers without a
//! lock server. Records are never referenced in place: a [`Region`] copies
//! them out and in with explicit bounds checks, and a remap requires
//! exclusive access to the owner of the region.
//!
//! ## Module Organization
//!
//! - `layout`: `GroupIndexHeader`, `GroupEntry`, `IndexEntry`, `GroupLoc`
//! - `region`: mapped or loaded file contents with checked access
//! - `lock`: `fcntl` byte-range locks as RAII guards
//! - `hash`: `GroupHash` and `Token`
//!
//! ## Platform Support
//!
//! Unix only: record locks use `fcntl` and file identity uses the inode
//! number from `std::os::unix::fs::MetadataExt`.

mod hash;
mod layout;
mod lock;
mod region;

pub use hash::{GroupHash, Token};
pub use layout::{GroupEntry, GroupIndexHeader, GroupLoc, IndexEntry};
pub use lock::{LockKind, RangeLock};
pub use region::{MapMode, Region};

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use eyre::{Result, WrapErr};

/// Inode of an open file, used as its identity across renames.
pub fn file_inode(file: &File, path: &Path) -> Result<u64> {
    let meta = file
        .metadata()
        .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;
    Ok(meta.ino())
}

/// Current length of an open file.
pub fn file_len(file: &File, path: &Path) -> Result<u64> {
    let meta = file
        .metadata()
        .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;
    Ok(meta.len())
}

/// Removes a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).wrap_err_with(|| format!("failed to unlink '{}'", path.display())),
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
