//! # Search Iterator
//!
//! A `Search` walks a contiguous article-number range of one group, yielding
//! present records in increasing article order. It is forward-only, finite,
//! and not restartable.
//!
//! The iterator holds an `Arc` to the group's data handle, so the handle stays
//! open while the search lives even if the cache evicts it. Dropping the
//! search releases that reference.
//!
//! ## Torn Records
//!
//! Before yielding a record the iterator checks that `offset + length` lies
//! inside the mapped DAT file. If not, DAT is remapped once (the record may
//! have been appended after the mapping was made); a record still out of
//! range after that is logged and skipped.

use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;
use tracing::warn;

use super::{Article, GroupData};

/// Data handle shared between the cache and open searches.
pub type SharedGroupData = Arc<Mutex<GroupData>>;

/// Cursor over one group's articles.
///
/// `current` and `limit` are article numbers, not slots, so a pack that
/// lowers the handle's base mid-scan moves the slot arithmetic with it.
#[derive(Debug)]
pub struct Search {
    data: SharedGroupData,
    current: u64,
    limit: u64,
}

impl Search {
    /// Opens a search over `[start, end]`.
    ///
    /// `high` is the group's high water mark from the group index. Returns
    /// `None` when the range is empty, lies entirely below the group's base,
    /// or starts past the high water mark.
    pub fn open(shared: &SharedGroupData, start: u64, end: u64, high: u64) -> Result<Option<Self>> {
        let mut data = shared.lock();

        if end < data.base() || end < start {
            return Ok(None);
        }
        if end > data.high() && high > data.high() {
            data.unmap_index();
            data.set_high(high);
        }
        if start > data.high() {
            return Ok(None);
        }

        data.refresh_mappings()?;

        let base = data.base();
        let current = start.max(base).max(1);

        if let (Some(first), Some(region)) = (data.slot(current - base), data.data_region()) {
            if first.is_present() {
                region.prefetch(first.offset() as usize, region.len());
            }
        }
        drop(data);

        Ok(Some(Self {
            data: Arc::clone(shared),
            current,
            limit: end,
        }))
    }

    /// Article number the next call to `next` starts scanning from.
    pub fn position(&self) -> u64 {
        self.current
    }
}

impl Iterator for Search {
    type Item = Article;

    fn next(&mut self) -> Option<Article> {
        let mut data = self.data.lock();
        // A pack through the same handle reopens IDX unmapped.
        if data.index_region().is_none() || data.data_region().is_none() {
            if let Err(e) = data.refresh_mappings() {
                warn!(path = %data.path().display(), error = %e, "cannot remap group for search");
                return None;
            }
        }
        next_article(&mut data, &mut self.current, self.limit)
    }
}

fn next_article(data: &mut GroupData, current: &mut u64, limit: u64) -> Option<Article> {
    loop {
        let base = data.base();
        if *current < base {
            *current = base;
        }
        let slots = data.mapped_slots();
        let mut found = None;
        while *current <= limit && *current - base < slots {
            match data.slot(*current - base) {
                Some(entry) if entry.is_present() => {
                    found = Some(entry);
                    break;
                }
                _ => *current += 1,
            }
        }
        let entry = found?;

        let data_len = data.data_region().map(|r| r.len() as u64).unwrap_or(0);
        if entry.end() > data_len {
            data.unmap_data();
            if let Err(e) = data.map_data() {
                warn!(path = %data.path().display(), error = %e, "cannot remap overview data");
                return None;
            }
        }

        let number = *current;
        *current += 1;

        let overview = data
            .data_region()
            .and_then(|region| region.slice(entry.offset(), entry.length() as usize));
        match overview {
            Some(bytes) => {
                return Some(Article {
                    number,
                    overview: bytes.to_vec(),
                    token: entry.token(),
                    arrived: entry.arrived(),
                    expires: entry.expires(),
                });
            }
            None => {
                warn!(
                    article = number,
                    path = %data.path().display(),
                    offset = entry.offset(),
                    length = entry.length(),
                    "invalid index entry, skipping"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ArticleRef, DataOptions};
    use crate::storage::{MapMode, Token};
    use std::fs::OpenOptions;
    use std::os::unix::fs::FileExt;
    use tempfile::tempdir;
    use zerocopy::IntoBytes;

    fn writable() -> DataOptions {
        DataOptions {
            writable: true,
            map_mode: MapMode::Mmap,
            nfs_reader: false,
        }
    }

    fn store(data: &mut GroupData, number: u64) {
        let overview = format!("{}\tSubject: {}\r\n", number, number);
        data.store(&ArticleRef {
            number,
            overview: overview.as_bytes(),
            token: Token::default(),
            arrived: number as i64,
            expires: 0,
        })
        .unwrap();
    }

    fn shared_with(dir: &std::path::Path, numbers: &[u64]) -> SharedGroupData {
        let mut data = GroupData::new(dir, "example.test", writable()).unwrap();
        data.open_files().unwrap();
        for &n in numbers {
            store(&mut data, n);
        }
        Arc::new(Mutex::new(data))
    }

    #[test]
    fn search_yields_present_articles_in_order() {
        let dir = tempdir().unwrap();
        let shared = shared_with(dir.path(), &[5, 3, 9]);

        let numbers: Vec<u64> = Search::open(&shared, 1, 10, 9)
            .unwrap()
            .unwrap()
            .map(|a| a.number)
            .collect();

        assert_eq!(numbers, vec![3, 5, 9]);
    }

    #[test]
    fn search_respects_range_bounds() {
        let dir = tempdir().unwrap();
        let shared = shared_with(dir.path(), &[1, 2, 3, 4, 5]);

        let numbers: Vec<u64> = Search::open(&shared, 2, 4, 5)
            .unwrap()
            .unwrap()
            .map(|a| a.number)
            .collect();

        assert_eq!(numbers, vec![2, 3, 4]);
    }

    #[test]
    fn search_returns_overview_bytes_and_arrival() {
        let dir = tempdir().unwrap();
        let shared = shared_with(dir.path(), &[7]);

        let article = Search::open(&shared, 7, 7, 7).unwrap().unwrap().next().unwrap();

        assert_eq!(article.overview, b"7\tSubject: 7\r\n".to_vec());
        assert_eq!(article.arrived, 7);
    }

    #[test]
    fn search_with_inverted_range_is_none() {
        let dir = tempdir().unwrap();
        let shared = shared_with(dir.path(), &[1, 2]);

        assert!(Search::open(&shared, 5, 2, 2).unwrap().is_none());
    }

    #[test]
    fn search_starting_past_high_is_none() {
        let dir = tempdir().unwrap();
        let shared = shared_with(dir.path(), &[1, 2]);

        assert!(Search::open(&shared, 10, 20, 2).unwrap().is_none());
    }

    #[test]
    fn search_skips_entry_pointing_past_data_end() {
        let dir = tempdir().unwrap();
        let shared = shared_with(dir.path(), &[1, 2, 3]);
        {
            let data = shared.lock();
            let bogus = crate::storage::IndexEntry::new(10_000, 20, 0, 0, Token::default());
            let idx = OpenOptions::new()
                .write(true)
                .open(data.file_path("IDX"))
                .unwrap();
            idx.write_all_at(bogus.as_bytes(), crate::config::INDEX_ENTRY_SIZE as u64)
                .unwrap();
        }

        let numbers: Vec<u64> = Search::open(&shared, 1, 3, 3)
            .unwrap()
            .unwrap()
            .map(|a| a.number)
            .collect();

        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn search_sees_append_after_open() {
        let dir = tempdir().unwrap();
        let shared = shared_with(dir.path(), &[1]);
        let mut search = Search::open(&shared, 1, 2, 1).unwrap().unwrap();
        assert_eq!(search.next().map(|a| a.number), Some(1));

        store(&mut shared.lock(), 2);

        // IDX mapping predates the append, so the search ends.
        assert_eq!(search.next(), None);
    }

    #[test]
    fn search_follows_pack_of_shared_handle() {
        let dir = tempdir().unwrap();
        let numbers: Vec<u64> = (1000..=1010).collect();
        let shared = shared_with(dir.path(), &numbers);
        let mut search = Search::open(&shared, 1000, 1010, 1010).unwrap().unwrap();
        assert_eq!(search.next().map(|a| a.number), Some(1000));

        {
            let mut data = shared.lock();
            data.pack(10).unwrap();
            store(&mut data, 10);
            store(&mut data, 135);
            assert!(data.entry(135, 1010).unwrap().is_some());
        }

        let rest: Vec<u64> = search.map(|a| a.number).collect();
        assert_eq!(rest, (1001..=1010).collect::<Vec<_>>());
    }

    #[test]
    fn search_keeps_handle_alive() {
        let dir = tempdir().unwrap();
        let shared = shared_with(dir.path(), &[1]);
        let search = Search::open(&shared, 1, 1, 1).unwrap().unwrap();

        assert_eq!(Arc::strong_count(&shared), 2);
        drop(search);
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
