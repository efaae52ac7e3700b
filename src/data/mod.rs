//! # Group Data Files
//!
//! Each newsgroup owns a pair of files holding its overview records:
//!
//! ```text
//! <group>.IDX   IndexEntry array; slot N describes article base + N
//! <group>.DAT   overview lines appended back to back
//!
//!   IDX                                   DAT
//! +---------------------------+         +--------------------------+
//! | slot 0: art base   (len 0)|         | "3\tSubject: lo\r\n"     |
//! | slot 1: art base+1 -------|------+  | "5\tSubject: hi\r\n"     |
//! | ...                       |      +->|                          |
//! +---------------------------+         +--------------------------+
//! ```
//!
//! A slot with length zero is "present but empty": never posted, cancelled,
//! or expired. Gaps are never compacted except by a full rebuild.
//!
//! ## Writes
//!
//! [`GroupData::store`] appends the overview bytes to DAT first and only then
//! writes the IndexEntry at `(article - base) * INDEX_ENTRY_SIZE` in IDX, so a
//! failed append never leaves an index entry pointing at missing data. The
//! first store into an empty group picks `base = max(1, article - SLOP)`.
//! Storing below `base` fails; the caller packs first (see `rebuild`).
//!
//! ## Reads
//!
//! Both files are mapped (or loaded, when mmap is disabled) lazily. A
//! handle remembers the `high` water mark it was opened with; when a caller
//! asks for an article past that mark and the group index says it exists,
//! the IDX mapping is refreshed once before concluding the article is absent.
//!
//! ## Identity
//!
//! `index_inode` records which IDX file the handle has open. Packs and
//! rebuilds replace IDX by rename, so an inode differing from the one in
//! the group index means the handle is stale.

mod inspect;
mod rebuild;
mod search;

pub use inspect::{audit_overview, DataAudit};
pub use search::{Search, SharedGroupData};

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Seek, Write};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{trace, warn};
use zerocopy::IntoBytes;

use crate::config::{
    DATA_DIR_MODE, DATA_FILE_MODE, INDEX_BASE_SLOP, INDEX_ENTRY_SIZE, SUFFIX_DATA, SUFFIX_INDEX,
};
use crate::storage::{file_inode, file_len, remove_if_exists, IndexEntry, MapMode, Region, Token};

/// Overview record handed to the store path. Borrows the overview bytes.
#[derive(Debug, Clone, Copy)]
pub struct ArticleRef<'a> {
    pub number: u64,
    pub overview: &'a [u8],
    pub token: Token,
    pub arrived: i64,
    pub expires: i64,
}

/// Overview record produced by a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub number: u64,
    pub overview: Vec<u8>,
    pub token: Token,
    pub arrived: i64,
    pub expires: i64,
}

impl Article {
    pub fn view(&self) -> ArticleRef<'_> {
        ArticleRef {
            number: self.number,
            overview: &self.overview,
            token: self.token,
            arrived: self.arrived,
            expires: self.expires,
        }
    }
}

/// How group data handles open and map their files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataOptions {
    pub writable: bool,
    pub map_mode: MapMode,
    pub nfs_reader: bool,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            writable: false,
            map_mode: MapMode::Mmap,
            nfs_reader: false,
        }
    }
}

/// Base article number for a group whose first stored article is `artnum`.
pub fn index_base(artnum: u64) -> u64 {
    if artnum > INDEX_BASE_SLOP {
        artnum - INDEX_BASE_SLOP
    } else {
        1
    }
}

/// Path of a group's files without the suffix.
///
/// One directory level per dot-separated component, named by the
/// component's first character: `news.announce.newgroups` lives under
/// `n/a/n/news.announce.newgroups`.
pub fn group_path(root: &Path, group: &str) -> Result<PathBuf> {
    ensure!(!group.is_empty(), "empty group name");
    ensure!(
        !group.contains('/') && !group.contains('\0') && group != "." && group != "..",
        "invalid group name '{}'",
        group
    );

    let mut path = root.to_path_buf();
    for component in group.split('.') {
        if let Some(first) = component.chars().next() {
            path.push(first.to_string());
        }
    }
    path.push(group);
    Ok(path)
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn open_file(path: &Path, writable: bool, append: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if writable {
        options.write(true).create(true).mode(DATA_FILE_MODE);
        if append {
            options.append(true);
        }
    }

    match options.open(path) {
        Ok(file) => Ok(file),
        Err(e) if writable && e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(DATA_DIR_MODE)
                    .create(parent)
                    .wrap_err_with(|| format!("failed to create directory '{}'", parent.display()))?;
            }
            options
                .open(path)
                .wrap_err_with(|| format!("failed to open '{}'", path.display()))
        }
        Err(e) => Err(e).wrap_err_with(|| format!("failed to open '{}'", path.display())),
    }
}

fn is_stale(file: Option<&File>) -> bool {
    match file {
        Some(file) => matches!(
            file.metadata(),
            Err(ref e) if e.raw_os_error() == Some(libc::ESTALE)
        ),
        None => false,
    }
}

#[derive(Debug)]
pub struct GroupData {
    path: PathBuf,
    options: DataOptions,
    high: u64,
    base: u64,
    index_inode: u64,
    index_file: Option<File>,
    data_file: Option<File>,
    index: Option<Region>,
    data: Option<Region>,
    remap_pending: bool,
}

impl GroupData {
    /// Creates an unopened handle for `group` under the overview root.
    pub fn new(root: &Path, group: &str, options: DataOptions) -> Result<Self> {
        Ok(Self {
            path: group_path(root, group)?,
            options,
            high: 0,
            base: 0,
            index_inode: 0,
            index_file: None,
            data_file: None,
            index: None,
            data: None,
            remap_pending: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.options.writable
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn set_high(&mut self, high: u64) {
        self.high = high;
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn set_base(&mut self, base: u64) {
        self.base = base;
    }

    pub fn index_inode(&self) -> u64 {
        self.index_inode
    }

    pub(crate) fn file_path(&self, suffix: &str) -> PathBuf {
        with_suffix(&self.path, suffix)
    }

    /// Opens (or reopens) IDX and DAT, creating them when writable.
    pub fn open_files(&mut self) -> Result<()> {
        self.open_index_file(SUFFIX_INDEX)?;
        self.open_data_file(SUFFIX_DATA)?;
        Ok(())
    }

    pub(crate) fn open_index_file(&mut self, suffix: &str) -> Result<()> {
        let path = self.file_path(suffix);
        self.unmap_index();
        let file = open_file(&path, self.options.writable, false)?;
        self.index_inode = file_inode(&file, &path)?;
        self.index_file = Some(file);
        Ok(())
    }

    pub(crate) fn open_data_file(&mut self, suffix: &str) -> Result<()> {
        let path = self.file_path(suffix);
        self.unmap_data();
        let file = open_file(&path, self.options.writable, true)?;
        self.data_file = Some(file);
        Ok(())
    }

    pub(crate) fn map_index(&mut self) -> Result<()> {
        let path = self.file_path(SUFFIX_INDEX);
        if is_stale(self.index_file.as_ref()) {
            self.open_index_file(SUFFIX_INDEX)?;
        }
        let file = match &self.index_file {
            Some(file) => file,
            None => bail!("index file '{}' is not open", path.display()),
        };
        let len = file_len(file, &path)?;
        self.index = Some(Region::map_readonly(file, len, self.options.map_mode, &path)?);
        Ok(())
    }

    pub(crate) fn map_data(&mut self) -> Result<()> {
        let path = self.file_path(SUFFIX_DATA);
        if is_stale(self.data_file.as_ref()) {
            self.open_data_file(SUFFIX_DATA)?;
        }
        let file = match &self.data_file {
            Some(file) => file,
            None => bail!("data file '{}' is not open", path.display()),
        };
        let len = file_len(file, &path)?;
        self.data = Some(Region::map_readonly(file, len, self.options.map_mode, &path)?);
        Ok(())
    }

    pub(crate) fn unmap_index(&mut self) {
        self.index = None;
    }

    pub(crate) fn unmap_data(&mut self) {
        self.data = None;
    }

    /// Drops mappings invalidated by this handle's own appends or a stale
    /// NFS handle, then maps whatever is missing.
    pub(crate) fn refresh_mappings(&mut self) -> Result<()> {
        if self.remap_pending {
            self.unmap_index();
            self.unmap_data();
            self.remap_pending = false;
        }
        if self.options.nfs_reader && is_stale(self.index_file.as_ref()) {
            self.unmap_index();
        }
        if self.index.is_none() {
            self.map_index()?;
        }
        if self.options.nfs_reader && is_stale(self.data_file.as_ref()) {
            self.unmap_data();
        }
        if self.data.is_none() {
            self.map_data()?;
        }
        Ok(())
    }

    /// Number of whole IndexEntry slots currently mapped.
    pub(crate) fn mapped_slots(&self) -> u64 {
        self.index
            .as_ref()
            .map(|region| (region.len() / INDEX_ENTRY_SIZE) as u64)
            .unwrap_or(0)
    }

    pub(crate) fn slot(&self, slot: u64) -> Option<IndexEntry> {
        let offset = usize::try_from(slot).ok()?.checked_mul(INDEX_ENTRY_SIZE)?;
        self.index.as_ref()?.read::<IndexEntry>(offset)
    }

    pub(crate) fn index_region(&self) -> Option<&Region> {
        self.index.as_ref()
    }

    pub(crate) fn data_region(&self) -> Option<&Region> {
        self.data.as_ref()
    }

    /// Looks up the index entry for `article`.
    ///
    /// `high` is the group's current high water mark from the group index;
    /// if the article lies past what this handle has mapped but `high` says
    /// it should exist, IDX is remapped once first.
    pub fn entry(&mut self, article: u64, high: u64) -> Result<Option<IndexEntry>> {
        if self.remap_pending {
            self.unmap_index();
            self.unmap_data();
            self.remap_pending = false;
        }
        if article > self.high && high > self.high {
            self.unmap_index();
            self.high = high;
        } else if self.options.nfs_reader && is_stale(self.index_file.as_ref()) {
            self.unmap_index();
        }
        if self.index.is_none() {
            self.map_index()?;
        }

        if article < self.base {
            return Ok(None);
        }
        let entry = self.slot(article - self.base);
        Ok(entry.filter(IndexEntry::is_present))
    }

    /// Appends one overview record and writes its index entry.
    pub fn store(&mut self, article: &ArticleRef<'_>) -> Result<()> {
        ensure!(
            self.options.writable,
            "cannot store into read-only group '{}'",
            self.path.display()
        );
        ensure!(
            !article.overview.is_empty(),
            "empty overview data for article {} in '{}'",
            article.number,
            self.path.display()
        );
        let length = u32::try_from(article.overview.len()).map_err(|_| {
            eyre::eyre!(
                "overview data for article {} is too large ({} bytes)",
                article.number,
                article.overview.len()
            )
        })?;

        if self.base == 0 {
            self.base = index_base(article.number);
        }
        ensure!(
            self.base <= article.number,
            "cannot add {} to '{}.IDX', base == {}",
            article.number,
            self.path.display(),
            self.base
        );

        let data_path = self.file_path(SUFFIX_DATA);
        let data_file = match self.data_file.as_mut() {
            Some(file) => file,
            None => bail!("data file '{}' is not open", data_path.display()),
        };
        data_file.write_all(article.overview).wrap_err_with(|| {
            format!(
                "failed to append {} bytes for article {} to '{}'",
                length,
                article.number,
                data_path.display()
            )
        })?;
        let end = data_file.stream_position().wrap_err_with(|| {
            format!(
                "failed to get offset for article {} in '{}'",
                article.number,
                data_path.display()
            )
        })?;

        let entry = IndexEntry::new(
            end - u64::from(length),
            length,
            article.arrived,
            article.expires,
            article.token,
        );
        let slot = article.number - self.base;
        self.write_slot(slot, &entry)
            .wrap_err_with(|| format!("failed to write index record for {}", article.number))?;

        // A loaded copy never sees writes; a mapping misses slots past its end.
        if self.index.is_some()
            && (self.options.map_mode == MapMode::Read || slot >= self.mapped_slots())
        {
            self.remap_pending = true;
        }
        trace!(article = article.number, length, "stored overview record");
        Ok(())
    }

    fn write_slot(&self, slot: u64, entry: &IndexEntry) -> Result<()> {
        let path = self.file_path(SUFFIX_INDEX);
        let file = match &self.index_file {
            Some(file) => file,
            None => bail!("index file '{}' is not open", path.display()),
        };
        let offset = slot
            .checked_mul(INDEX_ENTRY_SIZE as u64)
            .ok_or_else(|| eyre::eyre!("index slot {} overflows '{}'", slot, path.display()))?;
        file.write_all_at(entry.as_bytes(), offset)
            .wrap_err_with(|| format!("failed to write '{}' at {}", path.display(), offset))
    }

    fn read_slot(&self, slot: u64) -> Result<Option<IndexEntry>> {
        let path = self.file_path(SUFFIX_INDEX);
        let file = match &self.index_file {
            Some(file) => file,
            None => bail!("index file '{}' is not open", path.display()),
        };
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        match file.read_exact_at(&mut buf, slot * INDEX_ENTRY_SIZE as u64) {
            Ok(()) => Ok(zerocopy::FromBytes::read_from_bytes(&buf[..]).ok()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e).wrap_err_with(|| format!("failed to read '{}'", path.display())),
        }
    }

    /// Clears the index entry of `artnum`, leaving its data unreachable.
    ///
    /// Returns whether a present entry was cleared.
    pub fn cancel(&mut self, artnum: u64, high: u64) -> Result<bool> {
        if !self.options.writable {
            return Ok(false);
        }
        if artnum > self.high && high > self.high {
            self.high = high;
        }
        if self.base == 0 || artnum < self.base || artnum > self.high {
            return Ok(false);
        }

        let slot = artnum - self.base;
        match self.read_slot(slot)? {
            Some(entry) if entry.is_present() => {}
            _ => return Ok(false),
        }
        self.write_slot(slot, &IndexEntry::empty())
            .wrap_err_with(|| format!("failed to cancel article {}", artnum))?;
        self.unmap_index();
        Ok(true)
    }

    /// Flushes both files to stable storage.
    pub fn sync(&self) -> Result<()> {
        for (file, suffix) in [(&self.index_file, SUFFIX_INDEX), (&self.data_file, SUFFIX_DATA)] {
            if let Some(file) = file {
                file.sync_all()
                    .wrap_err_with(|| format!("failed to sync '{}'", self.file_path(suffix).display()))?;
            }
        }
        Ok(())
    }

    /// Unmaps and closes both files.
    pub fn close(&mut self) {
        self.unmap_index();
        self.unmap_data();
        self.index_file = None;
        self.data_file = None;
    }

    /// Removes a group's IDX and DAT files. `suffix` is appended to both
    /// names, so `"-NEW"` removes leftovers of an interrupted rebuild.
    pub fn delete_files(root: &Path, group: &str, suffix: &str) -> Result<()> {
        let base = group_path(root, group)?;
        for kind in [SUFFIX_INDEX, SUFFIX_DATA] {
            let path = with_suffix(&base, &format!("{}{}", kind, suffix));
            if let Err(e) = remove_if_exists(&path) {
                warn!(path = %path.display(), error = %e, "cannot unlink group file");
            }
        }
        Ok(())
    }

    /// True when both live files exist on disk.
    pub fn files_exist(root: &Path, group: &str) -> Result<bool> {
        let base = group_path(root, group)?;
        Ok(fs::metadata(with_suffix(&base, SUFFIX_INDEX)).is_ok()
            && fs::metadata(with_suffix(&base, SUFFIX_DATA)).is_ok())
    }
}
