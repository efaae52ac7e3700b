//! # Tradindexed Overview
//!
//! The public entry point: one `Tradindexed` value owns an open group index
//! and the cache of open group data handles, and exposes the overview
//! operations in terms of group names and article numbers.
//!
//! ## Lifecycle
//!
//! ```text
//!   new(config) ──> Closed ──open(mode)──> Open ──close()──> Closed
//!                     ^                      │
//!                     └──── open() again ────┘ (error while Open)
//! ```
//!
//! Every operation other than `open`, `close`, and `is_open` fails while
//! the instance is closed.
//!
//! ## Request Flow
//!
//! ```text
//! add(group, art, ...)
//!   group index: find(group) -> GroupLoc, GroupEntry
//!   cache: lookup(hash) or open_data + insert
//!   group index: add_article (entry write lock, pack if art < base)
//!
//! open_search(group, low, high)
//!   group index: find(group)
//!   cache: handle, reopened if a pack or rebuild replaced its IDX
//!   Search::open(handle, low, high, entry.high)
//! ```
//!
//! Expire and rebuild bypass the cache: the cached handle is dropped first
//! and the group index works on freshly opened files.
//!
//! ## Thread Safety
//!
//! `Tradindexed` is `Send + Sync`. All state sits behind one
//! `parking_lot::Mutex`, so operations on one instance are serialized.
//! Searches hold their own reference to the group's handle and never touch
//! that mutex, so they remain usable after eviction or `close`.

mod builder;

pub use builder::{OverviewBuilder, OverviewConfig};
pub use crate::index::{ExpireBefore, ExpirePolicy, KeepAll};

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, DataCache};
use crate::config::{FDS_PER_GROUP, READ_ONLY_CACHE_SIZE};
use crate::data::{Article, ArticleRef, DataOptions, GroupData, Search, SharedGroupData};
use crate::index::GroupIndex;
use crate::storage::{GroupEntry, GroupHash, GroupLoc, MapMode, Token};

/// Access requested when opening an overview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// Water marks, article count, and status flag of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    pub low: u64,
    pub high: u64,
    pub count: u64,
    pub flag: u8,
}

impl From<&GroupEntry> for GroupStats {
    fn from(entry: &GroupEntry) -> Self {
        Self {
            low: entry.low(),
            high: entry.high(),
            count: entry.count(),
            flag: entry.flag(),
        }
    }
}

/// Order in which searches return articles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Increasing article number within a group.
    Newsgroup,
}

/// Control requests understood by [`Tradindexed::ctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctl {
    /// Free space left for overview data.
    Space,
    /// Order searches return articles in.
    Sort,
    /// Enables or disables the low water mark cutoff for `add`.
    CutoffLow(bool),
    /// Whether search results stay valid after the next search call.
    StaticSearch,
    CacheKeep,
    CacheFree,
}

/// Answers to [`Ctl`] requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlValue {
    /// Percentage of space used; `None` when not tracked.
    Space(Option<u8>),
    Sort(SortOrder),
    Flag(bool),
}

#[derive(Debug)]
struct State {
    mode: OpenMode,
    index: GroupIndex,
    cache: DataCache,
    cutoff: bool,
}

impl State {
    fn lookup(&mut self, group: &str) -> Result<Option<(GroupLoc, GroupEntry)>> {
        self.index.lookup(group)
    }

    /// Cached handle for `group`, opened on a miss.
    fn data(&mut self, group: &str, loc: GroupLoc) -> Result<SharedGroupData> {
        let hash = GroupHash::of(group);
        if let Some(data) = self.cache.lookup(&hash) {
            return Ok(data);
        }
        let data = self.index.open_data(group, loc)?;
        Ok(self.cache.insert(hash, data))
    }

    /// Replaces the cached handle for `group` with a freshly opened one.
    fn reopen(&mut self, group: &str, loc: GroupLoc) -> Result<SharedGroupData> {
        let hash = GroupHash::of(group);
        self.cache.remove(&hash);
        let data = self.index.open_data(group, loc)?;
        Ok(self.cache.insert(hash, data))
    }

    fn ensure_writable(&self, operation: &str) -> Result<()> {
        ensure!(
            self.mode.is_writable(),
            "cannot {} on an overview opened read-only",
            operation
        );
        Ok(())
    }
}

/// Whether a cached handle no longer describes the group's current files.
///
/// The inode changes on every pack and rebuild. The base also changes
/// without a new inode when the first article lands in a group whose
/// handle was opened empty.
fn is_stale(entry: &GroupEntry, data: &GroupData) -> bool {
    entry.index_inode() != data.index_inode() || entry.base() != data.base()
}

/// Soft limit on open file descriptors, if any.
fn descriptor_limit() -> Option<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct passed to it.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        return None;
    }
    Some(limit.rlim_cur as u64)
}

fn cache_capacity(requested: usize, mode: OpenMode) -> usize {
    if !mode.is_writable() {
        return READ_ONLY_CACHE_SIZE;
    }
    let requested = requested.max(1);
    match descriptor_limit() {
        Some(limit) => {
            let allowed = (limit / FDS_PER_GROUP).saturating_sub(2).max(1) as usize;
            if allowed < requested {
                warn!(requested, allowed, "group cache size limited by open file limit");
                allowed
            } else {
                requested
            }
        }
        None => requested,
    }
}

/// An overview database in one directory.
#[derive(Debug)]
pub struct Tradindexed {
    config: OverviewConfig,
    state: Mutex<Option<State>>,
}

impl Tradindexed {
    /// Creates a closed instance; call [`Tradindexed::open`] before use.
    pub fn new(config: OverviewConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    pub fn builder() -> OverviewBuilder {
        OverviewBuilder::new()
    }

    pub fn config(&self) -> &OverviewConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    fn with_state<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut State) -> Result<T>,
    {
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) => f(state),
            None => bail!("overview '{}' is not open", self.config.path.display()),
        }
    }

    /// Opens the group index, creating it when `mode` is writable.
    pub fn open(&self, mode: OpenMode) -> Result<()> {
        let mut guard = self.state.lock();
        ensure!(
            guard.is_none(),
            "overview '{}' is already open",
            self.config.path.display()
        );

        let options = DataOptions {
            writable: mode.is_writable(),
            map_mode: if self.config.mmap {
                MapMode::Mmap
            } else {
                MapMode::Read
            },
            nfs_reader: self.config.nfs_reader,
        };
        let index = GroupIndex::open(&self.config.path, options)?;
        let capacity = cache_capacity(self.config.cache_size, mode);

        info!(
            path = %self.config.path.display(),
            ?mode,
            cache = capacity,
            "opened overview"
        );
        *guard = Some(State {
            mode,
            index,
            cache: DataCache::new(capacity),
            cutoff: self.config.cutoff,
        });
        Ok(())
    }

    /// Releases the group index and every cached handle. Closing a closed
    /// instance does nothing.
    pub fn close(&self) {
        let state = self.state.lock().take();
        if let Some(state) = state {
            let stats = state.cache.stats();
            debug!(
                queries = stats.queries,
                hits = stats.hits,
                hit_rate = stats.hit_rate(),
                "overview cache statistics"
            );
        }
    }

    pub fn group_stats(&self, group: &str) -> Result<Option<GroupStats>> {
        self.with_state(|state| Ok(state.lookup(group)?.map(|(_, entry)| GroupStats::from(&entry))))
    }

    /// Registers `group`. Registering an existing group only updates its flag.
    pub fn group_add(&self, group: &str, low: u64, high: u64, flag: u8) -> Result<()> {
        self.with_state(|state| {
            state.ensure_writable("add a group")?;
            state.index.add(group, low, high, flag)?;
            Ok(())
        })
    }

    /// Removes `group` and its data files. Removing an unknown group succeeds.
    pub fn group_del(&self, group: &str) -> Result<()> {
        self.with_state(|state| {
            state.ensure_writable("delete a group")?;
            state.cache.remove(&GroupHash::of(group));
            if !state.index.delete(group)? {
                debug!(group, "delete of unknown group");
            }
            Ok(())
        })
    }

    /// Stores one overview record.
    ///
    /// Articles for unknown groups are ignored, as are articles below the
    /// group's low water mark while cutoff is enabled.
    pub fn add(
        &self,
        group: &str,
        artnum: u64,
        token: Token,
        overview: &[u8],
        arrived: i64,
        expires: i64,
    ) -> Result<()> {
        self.with_state(|state| {
            state.ensure_writable("add an article")?;
            let (loc, entry) = match state.lookup(group)? {
                Some(found) => found,
                None => return Ok(()),
            };
            if state.cutoff && entry.low() > artnum {
                return Ok(());
            }

            let shared = state.data(group, loc)?;
            let mut data = shared.lock();
            let article = ArticleRef {
                number: artnum,
                overview,
                token,
                arrived,
                expires,
            };
            state
                .index
                .add_article(loc, &mut data, &article)
                .map_err(|e| e.wrap_err(format!("cannot add {}:{}", group, artnum)))
        })
    }

    /// Removes one article's overview record. Returns whether it existed.
    pub fn cancel(&self, group: &str, artnum: u64) -> Result<bool> {
        self.with_state(|state| {
            state.ensure_writable("cancel an article")?;
            let (loc, _) = match state.lookup(group)? {
                Some(found) => found,
                None => return Ok(false),
            };

            let mut shared = state.data(group, loc)?;
            if artnum > shared.lock().high() {
                shared = state.reopen(group, loc)?;
            }
            let mut data = shared.lock();
            state
                .index
                .cancel_article(loc, &mut data, artnum)
                .map_err(|e| e.wrap_err(format!("cannot cancel {}:{}", group, artnum)))
        })
    }

    /// Opens a search over articles `low..=high` of `group`.
    ///
    /// Returns `None` for an unknown group or an empty range.
    pub fn open_search(&self, group: &str, low: u64, high: u64) -> Result<Option<Search>> {
        self.with_state(|state| {
            let (loc, entry) = match state.lookup(group)? {
                Some(found) => found,
                None => return Ok(None),
            };

            let mut shared = state.data(group, loc)?;
            if is_stale(&entry, &shared.lock()) {
                shared = state.reopen(group, loc)?;
            }
            Search::open(&shared, low, high, entry.high())
        })
    }

    /// Ends a search. Equivalent to dropping it.
    pub fn close_search(&self, search: Search) {
        drop(search);
    }

    /// Storage token of one article, if present.
    pub fn get_art_info(&self, group: &str, artnum: u64) -> Result<Option<Token>> {
        self.with_state(|state| {
            let (loc, entry) = match state.lookup(group)? {
                Some(found) => found,
                None => return Ok(None),
            };

            let mut shared = state.data(group, loc)?;
            if is_stale(&entry, &shared.lock()) {
                shared = state.reopen(group, loc)?;
            }
            let index_entry = shared.lock().entry(artnum, entry.high())?;
            Ok(index_entry.map(|e| e.token()))
        })
    }

    /// Rewrites `group` keeping the articles `policy` accepts. Returns the
    /// new low water mark, or `None` for an unknown group.
    pub fn expire_group<P>(&self, group: &str, policy: &mut P) -> Result<Option<u64>>
    where
        P: ExpirePolicy + ?Sized,
    {
        self.with_state(|state| {
            state.ensure_writable("expire a group")?;
            state.cache.remove(&GroupHash::of(group));
            state.index.expire(group, policy)
        })
    }

    /// Replaces `group`'s data with `articles`, creating the group if needed.
    pub fn rebuild_group<I>(&self, group: &str, articles: I) -> Result<GroupStats>
    where
        I: IntoIterator<Item = Article>,
    {
        self.with_state(|state| {
            state.ensure_writable("rebuild a group")?;
            state.cache.remove(&GroupHash::of(group));
            let entry = state.index.rebuild(group, articles)?;
            Ok(GroupStats::from(&entry))
        })
    }

    pub fn ctl(&self, request: Ctl) -> Result<CtlValue> {
        self.with_state(|state| {
            Ok(match request {
                Ctl::Space => CtlValue::Space(None),
                Ctl::Sort => CtlValue::Sort(SortOrder::Newsgroup),
                Ctl::CutoffLow(enabled) => {
                    state.cutoff = enabled;
                    CtlValue::Flag(true)
                }
                Ctl::StaticSearch | Ctl::CacheKeep | Ctl::CacheFree => CtlValue::Flag(false),
            })
        })
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.with_state(|state| Ok(state.cache.stats()))
    }

    /// Runs `f` against the open group index, for maintenance tools.
    pub fn with_index<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut GroupIndex) -> Result<T>,
    {
        self.with_state(|state| f(&mut state.index))
    }
}

impl Drop for Tradindexed {
    fn drop(&mut self) {
        self.close();
    }
}
