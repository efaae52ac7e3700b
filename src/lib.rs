//! # tradindexed - Overview Storage for News Servers
//!
//! An on-disk store mapping (newsgroup, article number) to an overview line
//! and an opaque article storage token. It is built for one access pattern:
//! appends as articles arrive, ordered range scans by article number, and
//! point lookups, shared between one writer process and many readers
//! without a lock server.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tradindexed::{OpenMode, Token, Tradindexed};
//!
//! let overview = Tradindexed::builder()
//!     .path("./overview")
//!     .open(OpenMode::ReadWrite)?;
//!
//! overview.group_add("example.test", 0, 0, b'y')?;
//! overview.add("example.test", 5, token, b"5\tSubject: hi\r\n", 50, 0)?;
//!
//! if let Some(search) = overview.open_search("example.test", 1, 10)? {
//!     for article in search {
//!         println!("{} {}", article.number, article.token);
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Tradindexed (overview)        │
//! ├───────────────────┬─────────────────┤
//! │ Group Index       │ Open-Group Cache │
//! │ (index)           │ (cache)          │
//! ├───────────────────┴─────────────────┤
//! │  Group Data Files, Search (data)     │
//! ├─────────────────────────────────────┤
//! │  Layout, Regions, Range Locks        │
//! │  (storage)                           │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! overview_dir/
//! ├── group.index                 # hash table of per-group entries
//! └── e/t/
//!     ├── example.test.IDX        # fixed-stride per-article index
//!     └── example.test.DAT        # appended overview lines
//! ```
//!
//! ## Consistency
//!
//! Readers take no locks on the common path. A group's index file is only
//! ever replaced by rename, and its inode is recorded in the group index
//! after each replacement; a reader whose freshly opened file disagrees
//! with the recorded inode takes a read lock on the group's entry and
//! reopens.
//!
//! ## Module Overview
//!
//! - [`config`]: format constants and defaults
//! - [`storage`]: binary layout, mapped regions, byte-range locks
//! - [`data`]: per-group IDX/DAT files, pack, rebuild, search
//! - [`index`]: the group index, expire, audit
//! - [`cache`]: bounded cache of open group handles
//! - [`overview`]: the `Tradindexed` façade

#[macro_use]
mod macros;

pub mod cache;
pub mod config;
pub mod data;
pub mod index;
pub mod overview;
pub mod storage;

pub use cache::CacheStats;
pub use data::{Article, ArticleRef, Search};
pub use index::{ExpireBefore, ExpirePolicy, KeepAll};
pub use overview::{
    Ctl, CtlValue, GroupStats, OpenMode, OverviewBuilder, OverviewConfig, SortOrder, Tradindexed,
};
pub use storage::{GroupHash, Token};
