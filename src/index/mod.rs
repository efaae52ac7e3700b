//! # Group Index
//!
//! `group.index` maps newsgroup names to their per-group metadata. It is a
//! hash table with chained buckets stored in one flat file, using record
//! numbers (`GroupLoc`) instead of pointers:
//!
//! ```text
//! header                         entries
//! +-----------------+            +---------------------------+
//! | freelist ----------------->  | 7: free, next = 8         |
//! | bucket[0]  = -1 |            | ...                       |
//! | bucket[1]  = 3 ----------->  | 3: comp.lang.rust next = 5 ---+
//! | ...             |            | 5: alt.test       next = -1 <-+
//! +-----------------+            +---------------------------+
//! ```
//!
//! ## Operations
//!
//! - `find` hashes the name, walks its bucket chain, skips tombstones, and
//!   compares the full 128-bit hash.
//! - `add` re-registers an existing group by updating only its flag.
//!   Otherwise it reuses a tombstone from the target chain or pops the free
//!   list (expanding the file by `GROUP_INDEX_EXPAND_BY` entries when empty)
//!   and pushes the new entry at the head of its bucket.
//! - `delete` tombstones the entry in place (deletion time set, hash cleared)
//!   without touching the chain, so concurrent walkers never observe chain
//!   surgery.
//!
//! ## Locking
//!
//! Structural changes hold a write lock on the header range. Changes to one
//! group's data (append, pack, rebuild, cancel) hold a write lock on that
//! entry's byte range only. Readers take no locks except on the fallback
//! path of [`GroupIndex::open_data`].
//!
//! ## Mapping
//!
//! A writer maps the file read/write and shared. Readers either map it
//! read-only or, with mmap disabled, read every record with `pread` at its
//! computed offset so nothing is ever stale. Another process growing the file
//! is detected when a `GroupLoc` lies past the mapped entry count, at which
//! point the mapping is refreshed.
//!
//! ## Thread Safety
//!
//! `GroupIndex` is `Send` but mutation requires `&mut self`. Record locks are
//! per process, so threads sharing one index must serialize through a mutex
//! (the `Tradindexed` façade does).

mod audit;
mod expire;

pub use audit::{parse_active, print_entry, ActiveGroup, IndexAudit};
pub use expire::{ExpireBefore, ExpirePolicy, KeepAll};

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use tracing::{debug, warn};
use zerocopy::little_endian::I32;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::config::{
    DATA_FILE_MODE, GROUP_ENTRY_SIZE, GROUP_HEADER_PREFIX_SIZE, GROUP_HEADER_SIZE,
    GROUP_INDEX_EXPAND_BY, GROUP_INDEX_FILE, GROUP_INDEX_MAGIC, GROUP_LOC_NONE, TDX_HASH_SIZE,
};
use crate::data::{ArticleRef, DataOptions, GroupData};
use crate::storage::{
    file_len, unix_now, GroupEntry, GroupHash, GroupIndexHeader, GroupLoc, LockKind, MapMode,
    RangeLock, Region,
};

/// Number of whole entries in a group index of `size` bytes.
fn entry_count(size: u64) -> usize {
    if size < GROUP_HEADER_SIZE as u64 {
        return 0;
    }
    ((size - GROUP_HEADER_SIZE as u64) / GROUP_ENTRY_SIZE as u64) as usize
}

/// Size of a group index holding `count` entries.
fn index_file_size(count: usize) -> u64 {
    GROUP_HEADER_SIZE as u64 + count as u64 * GROUP_ENTRY_SIZE as u64
}

fn bucket_offset(bucket: usize) -> usize {
    GROUP_HEADER_PREFIX_SIZE + bucket * 4
}

fn entry_offset(loc: GroupLoc) -> usize {
    GROUP_HEADER_SIZE + loc.index() * GROUP_ENTRY_SIZE
}

#[derive(Debug)]
enum Store {
    Mapped(Region),
    Direct,
}

#[derive(Debug)]
pub struct GroupIndex {
    path: PathBuf,
    root: PathBuf,
    file: Arc<File>,
    options: DataOptions,
    store: Store,
    count: usize,
}

impl GroupIndex {
    /// Opens `group.index` under `root`, creating and initializing it when
    /// writable.
    ///
    /// A writable index always uses a shared mapping; `options.map_mode`
    /// only affects readers.
    pub fn open(root: &Path, options: DataOptions) -> Result<Self> {
        let path = root.join(GROUP_INDEX_FILE);
        if options.writable {
            fs::create_dir_all(root)
                .wrap_err_with(|| format!("failed to create overview directory '{}'", root.display()))?;
        }

        let mut open = OpenOptions::new();
        open.read(true);
        if options.writable {
            open.write(true).create(true).mode(DATA_FILE_MODE);
        }
        let file = open
            .open(&path)
            .wrap_err_with(|| format!("failed to open group index '{}'", path.display()))?;
        let file = Arc::new(file);

        let mut index = Self {
            path,
            root: root.to_path_buf(),
            file,
            options,
            store: Store::Direct,
            count: 0,
        };

        if options.writable {
            let _lock = index.lock_header()?;
            index.remap()?;
            if index.count == 0 {
                index.expand()?;
            }
        } else {
            index.remap()?;
        }

        let header = index
            .header()
            .ok_or_else(|| eyre!("group index '{}' is not initialized", index.path.display()))?;
        header
            .validate()
            .wrap_err_with(|| format!("invalid group index '{}'", index.path.display()))?;

        debug!(path = %index.path.display(), entries = index.count, "opened group index");
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_writable(&self) -> bool {
        self.options.writable
    }

    pub fn data_options(&self) -> DataOptions {
        self.options
    }

    /// Number of entry slots currently visible.
    pub fn entry_count(&self) -> usize {
        self.count
    }

    fn read_at<T: FromBytes>(&self, offset: usize) -> Option<T> {
        match &self.store {
            Store::Mapped(region) => region.read::<T>(offset),
            Store::Direct => {
                let mut buf = vec![0u8; std::mem::size_of::<T>()];
                self.file.read_exact_at(&mut buf, offset as u64).ok()?;
                T::read_from_bytes(&buf).ok()
            }
        }
    }

    fn write_at<T: IntoBytes + Immutable + ?Sized>(&mut self, offset: usize, value: &T) -> Result<()> {
        match &mut self.store {
            Store::Mapped(region) => {
                region.write(offset, value)?;
                region.flush_range(offset, value.as_bytes().len())
            }
            Store::Direct => bail!("group index '{}' is not writable", self.path.display()),
        }
    }

    pub(crate) fn header(&self) -> Option<GroupIndexHeader> {
        self.read_at::<GroupIndexHeader>(0)
    }

    fn write_header(&mut self, header: &GroupIndexHeader) -> Result<()> {
        self.write_at(0, header)
    }

    pub(crate) fn bucket_head(&self, bucket: usize) -> Option<GroupLoc> {
        let raw = self.read_at::<I32>(bucket_offset(bucket))?;
        GroupLoc::from_raw(raw.get())
    }

    pub(crate) fn bucket_raw(&self, bucket: usize) -> i32 {
        self.read_at::<I32>(bucket_offset(bucket))
            .map(|raw| raw.get())
            .unwrap_or(GROUP_LOC_NONE)
    }

    fn set_bucket_raw(&mut self, bucket: usize, raw: i32) -> Result<()> {
        self.write_at(bucket_offset(bucket), &I32::new(raw))
    }

    fn set_bucket(&mut self, bucket: usize, loc: Option<GroupLoc>) -> Result<()> {
        self.set_bucket_raw(bucket, GroupLoc::to_raw(loc))
    }

    fn set_freelist(&mut self, loc: Option<GroupLoc>) -> Result<()> {
        let mut header = self
            .header()
            .ok_or_else(|| eyre!("group index '{}' has no header", self.path.display()))?;
        header.set_freelist(loc);
        self.write_header(&header)
    }

    /// Copy of the entry at `loc`, or `None` if `loc` is past the entry array.
    pub fn entry(&self, loc: GroupLoc) -> Option<GroupEntry> {
        if loc.index() >= self.count {
            return None;
        }
        self.read_at::<GroupEntry>(entry_offset(loc))
    }

    /// Overwrites the entry at `loc`.
    pub fn write_entry(&mut self, loc: GroupLoc, entry: &GroupEntry) -> Result<()> {
        ensure!(
            loc.index() < self.count,
            "group entry {} out of range (count={})",
            loc,
            self.count
        );
        self.write_at(entry_offset(loc), entry)
    }

    /// Reads, modifies, and writes back the entry at `loc`.
    pub fn update_entry<F>(&mut self, loc: GroupLoc, f: F) -> Result<GroupEntry>
    where
        F: FnOnce(&mut GroupEntry),
    {
        let mut entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("group entry {} out of range (count={})", loc, self.count))?;
        f(&mut entry);
        self.write_entry(loc, &entry)?;
        Ok(entry)
    }

    /// Re-establishes the view of the file at its current size.
    fn remap(&mut self) -> Result<()> {
        let len = file_len(&self.file, &self.path)?;
        let count = entry_count(len);
        self.store = Store::Direct;
        self.count = 0;

        if len < GROUP_HEADER_SIZE as u64 {
            return Ok(());
        }
        let mapped_len = index_file_size(count);
        self.store = if self.options.writable {
            Store::Mapped(Region::map_shared(&self.file, mapped_len, &self.path)?)
        } else {
            match self.options.map_mode {
                MapMode::Mmap => Store::Mapped(Region::map_readonly(
                    &self.file,
                    mapped_len,
                    MapMode::Mmap,
                    &self.path,
                )?),
                MapMode::Read => Store::Direct,
            }
        };
        self.count = count;
        Ok(())
    }

    /// Remaps if `loc` lies past the visible entries and the file has grown
    /// enough to cover it.
    fn maybe_remap(&mut self, loc: usize) -> Result<()> {
        if loc < self.count {
            return Ok(());
        }
        let len = file_len(&self.file, &self.path)?;
        if entry_count(len) <= self.count {
            return Ok(());
        }
        self.remap()
    }

    /// Grows the file by `GROUP_INDEX_EXPAND_BY` entries, linking them into
    /// the free list so the lowest new slot is handed out first. Initializes
    /// the header when the file is new. Caller holds the header lock.
    fn expand(&mut self) -> Result<()> {
        ensure!(
            self.options.writable,
            "cannot expand read-only group index '{}'",
            self.path.display()
        );
        let old_count = self.count;
        let new_count = old_count + GROUP_INDEX_EXPAND_BY;
        ensure!(
            new_count <= i32::MAX as usize,
            "group index '{}' cannot grow past {} entries",
            self.path.display(),
            old_count
        );

        self.store = Store::Direct;
        self.file
            .set_len(index_file_size(new_count))
            .wrap_err_with(|| format!("failed to expand '{}'", self.path.display()))?;

        if let Err(e) = self.remap() {
            if let Err(shrink) = self.file.set_len(index_file_size(old_count)) {
                warn!(path = %self.path.display(), error = %shrink, "cannot shrink group index");
            }
            return Err(e);
        }

        let mut header = self
            .header()
            .ok_or_else(|| eyre!("group index '{}' has no header", self.path.display()))?;
        if old_count == 0 && header.as_bytes()[..GROUP_INDEX_MAGIC.len()] != GROUP_INDEX_MAGIC {
            ensure!(
                header.as_bytes().iter().all(|&b| b == 0),
                "'{}' is not a group index",
                self.path.display()
            );
            header = GroupIndexHeader::new();
            let buckets = vec![I32::new(GROUP_LOC_NONE); TDX_HASH_SIZE];
            self.write_at(bucket_offset(0), buckets.as_slice())?;
        }

        let mut head = header.freelist();
        for recno in (old_count..new_count).rev() {
            let loc = GroupLoc::new(recno as u32);
            self.write_entry(loc, &GroupEntry::free(head))?;
            head = Some(loc);
        }
        header.set_freelist(head);
        self.write_header(&header)?;

        debug!(path = %self.path.display(), entries = new_count, "expanded group index");
        Ok(())
    }

    /// Write lock over the header and bucket table.
    pub fn lock_header(&self) -> Result<RangeLock> {
        RangeLock::acquire(&self.file, LockKind::Write, 0, GROUP_HEADER_SIZE as u64)
            .wrap_err_with(|| format!("failed to lock header of '{}'", self.path.display()))
    }

    /// Lock over the bytes of one group entry.
    pub fn lock_group(&self, loc: GroupLoc, kind: LockKind) -> Result<RangeLock> {
        RangeLock::acquire(
            &self.file,
            kind,
            entry_offset(loc) as u64,
            GROUP_ENTRY_SIZE as u64,
        )
        .wrap_err_with(|| format!("failed to lock group entry {}", loc))
    }

    /// Like [`GroupIndex::lock_group`] but fails with a retryable
    /// `WouldBlock` error instead of waiting.
    pub fn try_lock_group(&self, loc: GroupLoc, kind: LockKind) -> Result<RangeLock> {
        RangeLock::try_acquire(
            &self.file,
            kind,
            entry_offset(loc) as u64,
            GROUP_ENTRY_SIZE as u64,
        )
        .wrap_err_with(|| format!("group entry {} is busy", loc))
    }

    /// Finds the live entry for `group`.
    pub fn find(&mut self, group: &str) -> Result<Option<GroupLoc>> {
        self.find_hash(GroupHash::of(group))
    }

    pub(crate) fn find_hash(&mut self, hash: GroupHash) -> Result<Option<GroupLoc>> {
        if self.options.nfs_reader {
            self.maybe_remap(usize::MAX)?;
        }

        let mut current = self.bucket_head(hash.bucket());
        let mut steps = 0usize;
        while let Some(loc) = current {
            if loc.index() >= self.count {
                self.maybe_remap(loc.index())?;
                if loc.index() >= self.count {
                    warn!(entry = loc.recno(), "group index entry out of range");
                    return Ok(None);
                }
            }
            let entry = match self.entry(loc) {
                Some(entry) => entry,
                None => return Ok(None),
            };
            if !entry.is_deleted() && entry.hash() == hash {
                return Ok(Some(loc));
            }
            if entry.next() == Some(loc) || steps > self.count {
                warn!(entry = loc.recno(), "group index loop");
                return Ok(None);
            }
            steps += 1;
            current = entry.next();
        }
        Ok(None)
    }

    /// Location and a copy of the entry for `group`.
    pub fn lookup(&mut self, group: &str) -> Result<Option<(GroupLoc, GroupEntry)>> {
        match self.find(group)? {
            Some(loc) => Ok(self.entry(loc).map(|entry| (loc, entry))),
            None => Ok(None),
        }
    }

    /// Registers `group`, or updates its flag if it already exists.
    pub fn add(&mut self, group: &str, low: u64, high: u64, flag: u8) -> Result<GroupLoc> {
        ensure!(
            self.options.writable,
            "cannot add group '{}' to read-only index",
            group
        );
        crate::data::group_path(&self.root, group)?;

        if let Some(loc) = self.find(group)? {
            self.set_flag(loc, flag)?;
            return Ok(loc);
        }

        let _lock = self.lock_header()?;
        self.maybe_remap(usize::MAX)?;

        // Another writer may have added it while we waited for the lock.
        if let Some(loc) = self.find(group)? {
            self.set_flag(loc, flag)?;
            return Ok(loc);
        }

        let hash = GroupHash::of(group);
        let bucket = hash.bucket();
        let (loc, chained) = match self.chained_tombstone(bucket)? {
            Some(loc) => (loc, true),
            None => (self.pop_free()?, false),
        };

        let mut entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("free group entry {} out of range", loc))?;
        entry.set_hash(hash);
        entry.set_low(if low == 0 { 1 } else { low });
        entry.set_high(high);
        entry.set_deleted(0);
        entry.set_base(0);
        entry.set_count(0);
        entry.set_flag(flag);
        entry.set_index_inode(self.create_data_files(group));

        if chained {
            self.write_entry(loc, &entry)?;
        } else {
            let head = self.bucket_head(bucket);
            if head == Some(loc) {
                warn!(entry = loc.recno(), bucket, "refusing to add a loop");
                self.write_entry(loc, &entry)?;
            } else {
                entry.set_next(head);
                self.write_entry(loc, &entry)?;
                self.set_bucket(bucket, Some(loc))?;
            }
        }

        debug!(group, entry = loc.recno(), "added group");
        Ok(loc)
    }

    fn set_flag(&mut self, loc: GroupLoc, flag: u8) -> Result<()> {
        match self.entry(loc) {
            Some(entry) if entry.flag() != flag => {
                self.update_entry(loc, |e| e.set_flag(flag))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn create_data_files(&self, group: &str) -> u64 {
        let created = GroupData::new(&self.root, group, self.options).and_then(|mut data| {
            data.open_files()?;
            let inode = data.index_inode();
            data.close();
            Ok(inode)
        });
        match created {
            Ok(inode) => inode,
            Err(e) => {
                warn!(group, error = %format!("{:#}", e), "unable to create data files");
                0
            }
        }
    }

    /// First tombstoned entry in `bucket`'s chain. Caller holds the header lock.
    fn chained_tombstone(&mut self, bucket: usize) -> Result<Option<GroupLoc>> {
        let mut current = self.bucket_head(bucket);
        let mut steps = 0usize;
        while let Some(loc) = current {
            let entry = match self.entry(loc) {
                Some(entry) => entry,
                None => return Ok(None),
            };
            if entry.is_deleted() && entry.hash().is_empty() {
                return Ok(Some(loc));
            }
            if entry.next() == Some(loc) || steps > self.count {
                return Ok(None);
            }
            steps += 1;
            current = entry.next();
        }
        Ok(None)
    }

    /// Pops the free list, expanding first if it is empty. Caller holds the
    /// header lock.
    fn pop_free(&mut self) -> Result<GroupLoc> {
        let header = self
            .header()
            .ok_or_else(|| eyre!("group index '{}' has no header", self.path.display()))?;
        if header.freelist().is_none() {
            self.expand()?;
        }
        let header = self
            .header()
            .ok_or_else(|| eyre!("group index '{}' has no header", self.path.display()))?;
        let loc = header
            .freelist()
            .ok_or_else(|| eyre!("group index '{}' free list empty after expand", self.path.display()))?;
        self.maybe_remap(loc.index())?;
        let entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("free list head {} out of range", loc))?;
        self.set_freelist(entry.next())?;
        Ok(loc)
    }

    /// Tombstones `group` and removes its data files.
    ///
    /// The entry stays linked in its bucket chain; a later `add` hashing to
    /// the same bucket reuses it, and an audit with fix moves leftovers to
    /// the free list.
    pub fn delete(&mut self, group: &str) -> Result<bool> {
        ensure!(
            self.options.writable,
            "cannot delete group '{}' from read-only index",
            group
        );

        {
            let _lock = self.lock_header()?;
            let loc = match self.find(group)? {
                Some(loc) => loc,
                None => return Ok(false),
            };
            let _group_lock = self.lock_group(loc, LockKind::Write)?;
            self.update_entry(loc, |entry| {
                entry.set_deleted(unix_now().max(1));
                entry.set_hash(GroupHash::EMPTY);
            })?;
            debug!(group, entry = loc.recno(), "deleted group");
        }

        GroupData::delete_files(&self.root, group, "")?;
        Ok(true)
    }

    /// Opens `group`'s data files consistently with its entry at `loc`.
    ///
    /// Optimistic path: open the files, then read `high` and `base` without
    /// locking. If the IDX inode differs from the entry's, a pack or rebuild
    /// is racing this open; take a read lock on the entry, reopen, and
    /// re-read. A mismatch that survives the lock is logged and tolerated.
    pub fn open_data(&mut self, group: &str, loc: GroupLoc) -> Result<GroupData> {
        let mut data = GroupData::new(&self.root, group, self.options)?;
        data.open_files()
            .wrap_err_with(|| format!("cannot open group {}", group))?;

        let entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("group entry {} out of range", loc))?;
        let (mut high, mut base) = (entry.high(), entry.base());

        if entry.index_inode() != data.index_inode() {
            let _lock = self.lock_group(loc, LockKind::Read)?;
            data.open_files()
                .wrap_err_with(|| format!("cannot reopen group {}", group))?;
            let entry = self
                .entry(loc)
                .ok_or_else(|| eyre!("group entry {} out of range", loc))?;
            if entry.index_inode() != data.index_inode() {
                warn!(group, "index inode mismatch");
            }
            high = entry.high();
            base = entry.base();
        }

        data.set_high(high);
        data.set_base(base);
        Ok(data)
    }

    /// Stores one article for the group at `loc` and updates its entry.
    ///
    /// Holds the entry's write lock throughout. Reopens `data` if a pack or
    /// rebuild replaced its IDX, and packs first if the article lies below
    /// the current base. The pack's new base and inode are published only
    /// after its rename completes.
    pub fn add_article(
        &mut self,
        loc: GroupLoc,
        data: &mut GroupData,
        article: &ArticleRef<'_>,
    ) -> Result<()> {
        ensure!(
            self.options.writable,
            "cannot add article {} to read-only index",
            article.number
        );
        let _lock = self.lock_group(loc, LockKind::Write)?;

        let mut entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("group entry {} out of range", loc))?;

        if entry.index_inode() != data.index_inode() {
            data.open_files()?;
            if entry.index_inode() != data.index_inode() {
                warn!(hash = %entry.hash(), "index inode mismatch");
            }
            data.set_base(entry.base());
        }

        if entry.base() > article.number {
            data.pack(article.number)?;
            entry.set_index_inode(data.index_inode());
            entry.set_base(data.base());
            self.write_entry(loc, &entry)?;
        }

        data.store(article)?;

        if entry.base() == 0 {
            entry.set_base(data.base());
        }
        if entry.count() == 0 || entry.low() == 0 || entry.low() > article.number {
            entry.set_low(article.number);
        }
        if entry.high() < article.number {
            entry.set_high(article.number);
        }
        entry.set_count(entry.count() + 1);
        self.write_entry(loc, &entry)
    }

    /// Clears one article of the group at `loc` and decrements its count.
    pub fn cancel_article(&mut self, loc: GroupLoc, data: &mut GroupData, artnum: u64) -> Result<bool> {
        ensure!(
            self.options.writable,
            "cannot cancel article {} in read-only index",
            artnum
        );
        let _lock = self.lock_group(loc, LockKind::Write)?;
        let entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("group entry {} out of range", loc))?;

        if entry.index_inode() != data.index_inode() {
            data.open_files()?;
            data.set_base(entry.base());
        }
        if !data.cancel(artnum, entry.high())? {
            return Ok(false);
        }
        self.update_entry(loc, |e| e.set_count(e.count().saturating_sub(1)))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Token;
    use tempfile::tempdir;

    fn writable() -> DataOptions {
        DataOptions {
            writable: true,
            ..DataOptions::default()
        }
    }

    fn store(index: &mut GroupIndex, group: &str, number: u64) {
        let (loc, _) = index.lookup(group).unwrap().unwrap();
        let mut data = index.open_data(group, loc).unwrap();
        let overview = format!("{}\tSubject: {}\r\n", number, number);
        index
            .add_article(
                loc,
                &mut data,
                &ArticleRef {
                    number,
                    overview: overview.as_bytes(),
                    token: Token::new([number as u8; 18]),
                    arrived: number as i64,
                    expires: 0,
                },
            )
            .unwrap();
    }

    #[test]
    fn open_creates_initialized_index() {
        let dir = tempdir().unwrap();

        let index = GroupIndex::open(dir.path(), writable()).unwrap();

        assert_eq!(index.entry_count(), GROUP_INDEX_EXPAND_BY);
        assert_eq!(index.header().unwrap().freelist(), Some(GroupLoc::new(0)));
        assert_eq!(index.bucket_head(0), None);
        let size = fs::metadata(index.path()).unwrap().len();
        assert_eq!(size, index_file_size(GROUP_INDEX_EXPAND_BY));
    }

    #[test]
    fn open_read_only_fails_without_file() {
        let dir = tempdir().unwrap();

        assert!(GroupIndex::open(dir.path(), DataOptions::default()).is_err());
    }

    #[test]
    fn open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(GROUP_INDEX_FILE), vec![0xAB; GROUP_HEADER_SIZE + 96]).unwrap();

        assert!(GroupIndex::open(dir.path(), writable()).is_err());
    }

    #[test]
    fn add_then_find_returns_same_loc() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();

        let loc = index.add("comp.lang.rust", 0, 0, b'y').unwrap();

        assert_eq!(index.find("comp.lang.rust").unwrap(), Some(loc));
        assert_eq!(index.find("comp.lang.c").unwrap(), None);
        let entry = index.entry(loc).unwrap();
        assert_eq!(entry.low(), 1);
        assert_eq!(entry.high(), 0);
        assert_eq!(entry.flag(), b'y');
        assert_ne!(entry.index_inode(), 0);
    }

    #[test]
    fn add_pops_lowest_free_slot_first() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();

        let a = index.add("a.one", 0, 0, b'y').unwrap();
        let b = index.add("a.two", 0, 0, b'y').unwrap();

        assert_eq!(a, GroupLoc::new(0));
        assert_eq!(b, GroupLoc::new(1));
        assert_eq!(index.header().unwrap().freelist(), Some(GroupLoc::new(2)));
    }

    #[test]
    fn add_existing_group_updates_only_flag() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = index.add("example.test", 5, 10, b'y').unwrap();

        let again = index.add("example.test", 100, 200, b'm').unwrap();

        assert_eq!(again, loc);
        let entry = index.entry(loc).unwrap();
        assert_eq!((entry.low(), entry.high(), entry.flag()), (5, 10, b'm'));
    }

    #[test]
    fn add_expands_when_free_list_exhausted() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();

        for i in 0..=GROUP_INDEX_EXPAND_BY {
            index.add(&format!("g.{}", i), 0, 0, b'y').unwrap();
        }

        assert_eq!(index.entry_count(), 2 * GROUP_INDEX_EXPAND_BY);
        assert!(index.find("g.0").unwrap().is_some());
        assert!(index.find(&format!("g.{}", GROUP_INDEX_EXPAND_BY)).unwrap().is_some());
    }

    #[test]
    fn delete_tombstones_and_removes_files() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = index.add("example.test", 0, 0, b'y').unwrap();

        assert!(index.delete("example.test").unwrap());

        assert_eq!(index.find("example.test").unwrap(), None);
        let entry = index.entry(loc).unwrap();
        assert!(entry.is_deleted());
        assert!(entry.hash().is_empty());
        assert!(!GroupData::files_exist(dir.path(), "example.test").unwrap());
        assert!(!index.delete("example.test").unwrap());
    }

    #[test]
    fn deleted_slot_is_reused_by_group_in_same_bucket() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = index.add("example.test", 0, 0, b'y').unwrap();
        index.delete("example.test").unwrap();

        let again = index.add("example.test", 0, 0, b'y').unwrap();

        assert_eq!(again, loc);
        assert!(!index.entry(loc).unwrap().is_deleted());
    }

    #[test]
    fn reader_sees_groups_added_after_open() {
        let dir = tempdir().unwrap();
        let mut writer = GroupIndex::open(dir.path(), writable()).unwrap();
        let mut reader = GroupIndex::open(dir.path(), DataOptions::default()).unwrap();

        for i in 0..(GROUP_INDEX_EXPAND_BY + 5) {
            writer.add(&format!("g.{}", i), 0, 0, b'y').unwrap();
        }

        let last = format!("g.{}", GROUP_INDEX_EXPAND_BY + 4);
        assert!(reader.find(&last).unwrap().is_some());
    }

    #[test]
    fn direct_reader_sees_current_entries() {
        let dir = tempdir().unwrap();
        let mut writer = GroupIndex::open(dir.path(), writable()).unwrap();
        writer.add("example.test", 0, 0, b'y').unwrap();
        let options = DataOptions {
            map_mode: MapMode::Read,
            ..DataOptions::default()
        };
        let mut reader = GroupIndex::open(dir.path(), options).unwrap();

        store(&mut writer, "example.test", 42);

        let (_, entry) = reader.lookup("example.test").unwrap().unwrap();
        assert_eq!(entry.high(), 42);
    }

    #[test]
    fn add_article_updates_watermarks_and_count() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        index.add("example.test", 0, 0, b'y').unwrap();

        store(&mut index, "example.test", 5);
        store(&mut index, "example.test", 3);

        let (_, entry) = index.lookup("example.test").unwrap().unwrap();
        assert_eq!((entry.low(), entry.high(), entry.count()), (3, 5, 2));
        assert_eq!(entry.base(), 1);
    }

    #[test]
    fn add_article_below_base_packs() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = index.add("example.test", 0, 0, b'y').unwrap();
        store(&mut index, "example.test", 1000);
        let before = index.entry(loc).unwrap();

        store(&mut index, "example.test", 10);

        let after = index.entry(loc).unwrap();
        assert_eq!(after.base(), 1);
        assert_ne!(after.index_inode(), before.index_inode());
        let mut data = index.open_data("example.test", loc).unwrap();
        assert_eq!(data.index_inode(), after.index_inode());
        assert!(data.entry(10, after.high()).unwrap().is_some());
        assert!(data.entry(1000, after.high()).unwrap().is_some());
    }

    #[test]
    fn open_data_reads_base_and_high() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = index.add("example.test", 0, 0, b'y').unwrap();
        store(&mut index, "example.test", 300);

        let data = index.open_data("example.test", loc).unwrap();

        assert_eq!(data.base(), 172);
        assert_eq!(data.high(), 300);
    }

    #[test]
    fn try_lock_group_succeeds_when_uncontended() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = index.add("example.test", 0, 0, b'y').unwrap();

        let lock = index.try_lock_group(loc, LockKind::Write).unwrap();

        assert_eq!(lock.len(), GROUP_ENTRY_SIZE as u64);
    }

    #[test]
    fn cancel_article_clears_entry_and_count() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = index.add("example.test", 0, 0, b'y').unwrap();
        store(&mut index, "example.test", 1);
        store(&mut index, "example.test", 2);
        let mut data = index.open_data("example.test", loc).unwrap();

        assert!(index.cancel_article(loc, &mut data, 2).unwrap());
        assert!(!index.cancel_article(loc, &mut data, 2).unwrap());

        assert_eq!(index.entry(loc).unwrap().count(), 1);
    }
}
