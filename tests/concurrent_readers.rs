//! # Concurrent Reader Tests
//!
//! One writer and several readers share an overview directory, each with its
//! own `Tradindexed` instance, the way a news server and its reader
//! processes do. Readers take no locks on the search path, so these tests
//! check what they observe while the writer appends, expires, and rebuilds.
//!
//! ```sh
//! cargo test --test concurrent_readers -- --nocapture
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::tempdir;
use tradindexed::{Article, KeepAll, OpenMode, Token, Tradindexed};

const GROUP: &str = "news.software.test";

fn open(path: &Path, mode: OpenMode) -> Tradindexed {
    Tradindexed::builder().path(path).open(mode).unwrap()
}

fn token(n: u64) -> Token {
    let mut bytes = [0u8; 18];
    bytes[..8].copy_from_slice(&n.to_be_bytes());
    Token::new(bytes)
}

fn line(n: u64) -> Vec<u8> {
    format!("{}\tSubject: article {}\tFrom: poster@example.com\r\n", n, n).into_bytes()
}

fn article(n: u64) -> Article {
    Article {
        number: n,
        overview: line(n),
        token: token(n),
        arrived: n as i64,
        expires: 0,
    }
}

fn check(article: &Article) {
    assert_eq!(article.overview, line(article.number));
    assert_eq!(article.token, token(article.number));
}

mod reader_tests {
    use super::*;

    #[test]
    fn readers_see_consistent_records_during_appends() {
        let dir = tempdir().unwrap();
        let writer = open(dir.path(), OpenMode::ReadWrite);
        writer.group_add(GROUP, 0, 0, b'y').unwrap();
        writer.add(GROUP, 1, token(1), &line(1), 1, 0).unwrap();

        const READERS: usize = 4;
        const ARTICLES: u64 = 2000;
        let done = Arc::new(AtomicBool::new(false));
        let start = Arc::new(Barrier::new(READERS + 1));

        let handles: Vec<_> = (0..READERS)
            .map(|_| {
                let path = dir.path().to_path_buf();
                let done = Arc::clone(&done);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    let reader = open(&path, OpenMode::Read);
                    start.wait();
                    let mut scans = 0u64;
                    let mut most = 0usize;
                    while !done.load(Ordering::Acquire) || scans == 0 {
                        let search = reader.open_search(GROUP, 1, u64::MAX - 1).unwrap();
                        let found: Vec<Article> = search.map(|s| s.collect()).unwrap_or_default();
                        for pair in found.windows(2) {
                            assert!(pair[0].number < pair[1].number);
                        }
                        most = most.max(found.len());
                        scans += 1;
                    }
                    most
                })
            })
            .collect();

        start.wait();
        for n in 2..=ARTICLES {
            writer.add(GROUP, n, token(n), &line(n), n as i64, 0).unwrap();
        }
        done.store(true, Ordering::Release);

        for handle in handles {
            let most = handle.join().unwrap();
            assert!(most >= 1 && most <= ARTICLES as usize);
        }

        let reader = open(dir.path(), OpenMode::Read);
        let all: Vec<Article> = reader
            .open_search(GROUP, 1, ARTICLES)
            .unwrap()
            .unwrap()
            .collect();
        all.iter().for_each(check);
        let numbers: Vec<u64> = all.iter().map(|a| a.number).collect();
        assert_eq!(numbers, (1..=ARTICLES).collect::<Vec<_>>());
    }

    #[test]
    fn reader_picks_up_articles_added_after_open() {
        let dir = tempdir().unwrap();
        let writer = open(dir.path(), OpenMode::ReadWrite);
        writer.group_add(GROUP, 0, 0, b'y').unwrap();
        writer.add(GROUP, 1, token(1), &line(1), 1, 0).unwrap();

        let reader = open(dir.path(), OpenMode::Read);
        assert_eq!(reader.get_art_info(GROUP, 1).unwrap(), Some(token(1)));

        for n in 2..=300 {
            writer.add(GROUP, n, token(n), &line(n), n as i64, 0).unwrap();
        }

        assert_eq!(reader.get_art_info(GROUP, 300).unwrap(), Some(token(300)));
        let count = reader.open_search(GROUP, 1, 300).unwrap().unwrap().count();
        assert_eq!(count, 300);
    }

    #[test]
    fn reader_opened_on_empty_group_sees_first_article() {
        let dir = tempdir().unwrap();
        let writer = open(dir.path(), OpenMode::ReadWrite);
        writer.group_add(GROUP, 0, 0, b'y').unwrap();

        let reader = open(dir.path(), OpenMode::Read);
        assert_eq!(reader.get_art_info(GROUP, 1).unwrap(), None);

        writer.add(GROUP, 500, token(500), &line(500), 500, 0).unwrap();

        assert_eq!(reader.get_art_info(GROUP, 500).unwrap(), Some(token(500)));
        let found: Vec<Article> = reader
            .open_search(GROUP, 1, 500)
            .unwrap()
            .unwrap()
            .collect();
        assert_eq!(found.len(), 1);
        check(&found[0]);
        assert_eq!(found[0].number, 500);
    }

    #[test]
    fn open_search_keeps_snapshot_across_rebuild() {
        let dir = tempdir().unwrap();
        let writer = open(dir.path(), OpenMode::ReadWrite);
        writer.group_add(GROUP, 0, 0, b'y').unwrap();
        for n in 1..=50 {
            writer.add(GROUP, n, token(n), &line(n), n as i64, 0).unwrap();
        }

        let reader = open(dir.path(), OpenMode::Read);
        let mut search = reader.open_search(GROUP, 1, 50).unwrap().unwrap();
        let first = search.next().unwrap();
        assert_eq!(first.number, 1);

        writer
            .rebuild_group(GROUP, (100..=110).map(article))
            .unwrap();

        let rest: Vec<Article> = search.collect();
        assert_eq!(rest.len(), 49);
        assert_eq!(rest.last().map(|a| a.number), Some(50));
        rest.iter().for_each(check);

        let fresh: Vec<u64> = reader
            .open_search(GROUP, 1, 200)
            .unwrap()
            .unwrap()
            .map(|a| a.number)
            .collect();
        assert_eq!(fresh, (100..=110).collect::<Vec<_>>());
    }

    #[test]
    fn reader_follows_expire_in_other_instance() {
        let dir = tempdir().unwrap();
        let writer = open(dir.path(), OpenMode::ReadWrite);
        writer.group_add(GROUP, 0, 0, b'y').unwrap();
        for n in 1..=10 {
            writer.add(GROUP, n, token(n), &line(n), n as i64, 0).unwrap();
        }
        let reader = open(dir.path(), OpenMode::Read);
        assert_eq!(reader.get_art_info(GROUP, 3).unwrap(), Some(token(3)));

        writer.cancel(GROUP, 3).unwrap();
        writer.expire_group(GROUP, &mut KeepAll).unwrap();

        assert_eq!(reader.get_art_info(GROUP, 3).unwrap(), None);
        assert_eq!(reader.get_art_info(GROUP, 4).unwrap(), Some(token(4)));
        assert_eq!(reader.group_stats(GROUP).unwrap().unwrap().count, 9);
    }
}
