//! # Expire and Rebuild
//!
//! Both replace a group's data files wholesale: the surviving (or imported)
//! articles are written to `-NEW` files, swapped in by rename, and only then
//! is the group entry updated with the new inode, base, and water marks. The
//! entry's write lock is held for the whole operation, so a reader that
//! notices the inode change blocks on its read lock until the entry is
//! consistent again.
//!
//! ```text
//! lock entry (write)
//!   search old files over [base, high]
//!     keep? --yes--> store into -NEW, track low/high/count
//!   sync -NEW, rename into place
//!   write entry { inode, base, low, high, count }
//! unlock
//! ```
//!
//! `high` never decreases. A group left empty gets `low = high + 1`.

use std::sync::Arc;

use eyre::{eyre, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::data::{Article, ArticleRef, GroupData, Search};
use crate::storage::{GroupEntry, LockKind};

use super::GroupIndex;

/// Decides which articles survive an expire.
pub trait ExpirePolicy {
    /// Returns `true` to keep `article` in `group`.
    fn keep(&mut self, group: &str, article: &ArticleRef<'_>) -> bool;
}

impl<F> ExpirePolicy for F
where
    F: FnMut(&str, &ArticleRef<'_>) -> bool,
{
    fn keep(&mut self, group: &str, article: &ArticleRef<'_>) -> bool {
        self(group, article)
    }
}

/// Keeps every article. Expiring with it compacts the group's files.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAll;

impl ExpirePolicy for KeepAll {
    fn keep(&mut self, _group: &str, _article: &ArticleRef<'_>) -> bool {
        true
    }
}

/// Drops articles whose expiry time has passed. Articles without an explicit
/// expiry are dropped once they arrived more than `max_age` seconds before
/// `now`; with no `max_age` they are kept.
#[derive(Debug, Clone, Copy)]
pub struct ExpireBefore {
    pub now: i64,
    pub max_age: Option<i64>,
}

impl ExpirePolicy for ExpireBefore {
    fn keep(&mut self, _group: &str, article: &ArticleRef<'_>) -> bool {
        if article.expires != 0 {
            return article.expires > self.now;
        }
        match self.max_age {
            Some(age) => article.arrived.saturating_add(age) > self.now,
            None => true,
        }
    }
}

/// Water marks accumulated while filling a replacement file pair.
#[derive(Debug, Default)]
struct Rewritten {
    base: u64,
    low: u64,
    high: u64,
    count: u64,
}

impl Rewritten {
    fn store(&mut self, fresh: &mut GroupData, article: &ArticleRef<'_>) -> Result<()> {
        fresh.store(article)?;
        if self.base == 0 {
            self.base = fresh.base();
        }
        if self.low == 0 || article.number < self.low {
            self.low = article.number;
        }
        self.high = self.high.max(article.number);
        self.count += 1;
        Ok(())
    }

    /// Writes the new marks into `entry`. `high` only moves up.
    fn apply(&self, entry: &mut GroupEntry, inode: u64) {
        let high = entry.high().max(self.high);
        entry.set_index_inode(inode);
        entry.set_base(self.base);
        entry.set_count(self.count);
        entry.set_high(high);
        entry.set_low(if self.count == 0 { high + 1 } else { self.low });
    }
}

impl GroupIndex {
    /// Rewrites `group` keeping only the articles `policy` accepts.
    ///
    /// Returns the new low water mark, or `None` if the group does not
    /// exist.
    pub fn expire<P>(&mut self, group: &str, policy: &mut P) -> Result<Option<u64>>
    where
        P: ExpirePolicy + ?Sized,
    {
        let loc = match self.find(group)? {
            Some(loc) => loc,
            None => return Ok(None),
        };
        let _lock = self.lock_group(loc, LockKind::Write)?;
        let mut entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("group entry {} out of range", loc))?;

        let mut data = GroupData::new(self.root(), group, self.data_options())?;
        data.open_files()?;
        data.set_high(entry.high());
        data.set_base(entry.base());
        let start = data.base();
        let high = if entry.high() > 0 { entry.high() } else { data.base() };

        let mut fresh = GroupData::rebuild_start(self.root(), group, self.data_options())?;
        let mut rewritten = Rewritten::default();

        let shared = Arc::new(Mutex::new(data));
        let copied = (|| -> Result<()> {
            let search = match Search::open(&shared, start, high, high)? {
                Some(search) => search,
                None => return Ok(()),
            };
            for article in search {
                let view = article.view();
                if policy.keep(group, &view) {
                    rewritten.store(&mut fresh, &view)?;
                }
            }
            fresh.sync()
        })();
        shared.lock().close();

        let inode = fresh.index_inode();
        if let Err(e) = copied {
            if let Err(cleanup) = fresh.rebuild_abort(self.root(), group) {
                warn!(group, error = %cleanup, "cannot remove partial expire files");
            }
            return Err(e.wrap_err(format!("cannot expire {}", group)));
        }
        fresh.close();
        GroupData::rebuild_finish(self.root(), group)?;

        let old_high = entry.high();
        rewritten.apply(&mut entry, inode);
        self.write_entry(loc, &entry)?;

        debug!(
            group,
            kept = rewritten.count,
            low = entry.low(),
            high = old_high,
            "expired group"
        );
        Ok(Some(entry.low()))
    }

    /// Replaces `group`'s data with `articles`, creating the group if needed.
    ///
    /// Articles are stored in number order; duplicate numbers keep the last
    /// one given.
    pub fn rebuild<I>(&mut self, group: &str, articles: I) -> Result<GroupEntry>
    where
        I: IntoIterator<Item = Article>,
    {
        let loc = match self.find(group)? {
            Some(loc) => loc,
            None => self.add(group, 0, 0, b'y')?,
        };

        let mut sorted: Vec<Article> = articles.into_iter().collect();
        sorted.sort_by_key(|article| article.number);
        sorted.reverse();
        sorted.dedup_by_key(|article| article.number);
        sorted.reverse();

        let _lock = self.lock_group(loc, LockKind::Write)?;
        let mut entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("group entry {} out of range", loc))?;

        let mut fresh = GroupData::rebuild_start(self.root(), group, self.data_options())?;
        let mut rewritten = Rewritten::default();
        let filled = sorted
            .iter()
            .try_for_each(|article| rewritten.store(&mut fresh, &article.view()))
            .and_then(|_| fresh.sync());

        let inode = fresh.index_inode();
        if let Err(e) = filled {
            if let Err(cleanup) = fresh.rebuild_abort(self.root(), group) {
                warn!(group, error = %cleanup, "cannot remove partial rebuild files");
            }
            return Err(e.wrap_err(format!("cannot rebuild {}", group)));
        }
        fresh.close();
        GroupData::rebuild_finish(self.root(), group)?;

        rewritten.apply(&mut entry, inode);
        self.write_entry(loc, &entry)?;
        debug!(group, articles = rewritten.count, "rebuilt group");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataOptions;
    use crate::storage::{GroupLoc, Token};
    use tempfile::tempdir;

    fn writable() -> DataOptions {
        DataOptions {
            writable: true,
            ..DataOptions::default()
        }
    }

    fn article(number: u64, arrived: i64) -> Article {
        Article {
            number,
            overview: format!("{}\tSubject: {}\r\n", number, number).into_bytes(),
            token: Token::new([number as u8; 18]),
            arrived,
            expires: 0,
        }
    }

    fn populate(index: &mut GroupIndex, group: &str, numbers: &[u64]) -> GroupLoc {
        let loc = index.add(group, 0, 0, b'y').unwrap();
        for &n in numbers {
            let mut data = index.open_data(group, loc).unwrap();
            let a = article(n, n as i64);
            index.add_article(loc, &mut data, &a.view()).unwrap();
        }
        loc
    }

    fn numbers(index: &mut GroupIndex, group: &str, loc: GroupLoc) -> Vec<u64> {
        let entry = index.entry(loc).unwrap();
        let data = index.open_data(group, loc).unwrap();
        let shared = Arc::new(Mutex::new(data));
        match Search::open(&shared, entry.low(), entry.high(), entry.high()).unwrap() {
            Some(search) => search.map(|a| a.number).collect(),
            None => Vec::new(),
        }
    }

    #[test]
    fn expire_keeps_selected_articles() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = populate(&mut index, "example.test", &[1, 2, 3, 4, 5]);

        let mut keep_odd = |_: &str, a: &ArticleRef<'_>| a.number % 2 == 1;
        let low = index.expire("example.test", &mut keep_odd).unwrap();

        assert_eq!(low, Some(1));
        let entry = index.entry(loc).unwrap();
        assert_eq!((entry.low(), entry.high(), entry.count()), (1, 5, 3));
        assert_eq!(numbers(&mut index, "example.test", loc), vec![1, 3, 5]);
    }

    #[test]
    fn expire_everything_keeps_high() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = populate(&mut index, "example.test", &[10, 11, 12]);

        let mut drop_all = |_: &str, _: &ArticleRef<'_>| false;
        let low = index.expire("example.test", &mut drop_all).unwrap();

        assert_eq!(low, Some(13));
        let entry = index.entry(loc).unwrap();
        assert_eq!((entry.low(), entry.high(), entry.count()), (13, 12, 0));
    }

    #[test]
    fn expire_changes_index_inode() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();
        let loc = populate(&mut index, "example.test", &[1, 2]);
        let before = index.entry(loc).unwrap().index_inode();

        index.expire("example.test", &mut KeepAll).unwrap();

        let after = index.entry(loc).unwrap();
        assert_ne!(after.index_inode(), before);
        let data = index.open_data("example.test", loc).unwrap();
        assert_eq!(data.index_inode(), after.index_inode());
    }

    #[test]
    fn expire_unknown_group_is_none() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();

        assert_eq!(index.expire("no.such.group", &mut KeepAll).unwrap(), None);
    }

    #[test]
    fn expire_before_uses_expiry_then_age() {
        let mut policy = ExpireBefore {
            now: 1000,
            max_age: Some(100),
        };
        let token = Token::default();
        let make = |arrived, expires| ArticleRef {
            number: 1,
            overview: b"1\tx",
            token,
            arrived,
            expires,
        };

        assert!(policy.keep("g", &make(0, 2000)));
        assert!(!policy.keep("g", &make(999, 500)));
        assert!(policy.keep("g", &make(950, 0)));
        assert!(!policy.keep("g", &make(850, 0)));
    }

    #[test]
    fn rebuild_creates_group_from_articles() {
        let dir = tempdir().unwrap();
        let mut index = GroupIndex::open(dir.path(), writable()).unwrap();

        let entry = index
            .rebuild("example.test", vec![article(7, 1), article(3, 1), article(7, 2)])
            .unwrap();

        assert_eq!((entry.low(), entry.high(), entry.count()), (3, 7, 2));
        let loc = index.find("example.test").unwrap().unwrap();
        assert_eq!(numbers(&mut index, "example.test", loc), vec![3, 7]);
    }
}
