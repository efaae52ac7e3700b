//! Dumping and auditing of a single group's data files. Not used on the
//! normal read/write paths; `tdx-util` and the group index audit call in here.

use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{Result, WrapErr};
use tracing::warn;
use zerocopy::IntoBytes;

use crate::config::{INDEX_ENTRY_SIZE, SUFFIX_INDEX};
use crate::storage::{GroupEntry, IndexEntry};

use super::{DataOptions, GroupData};

/// Findings of a data audit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DataAudit {
    pub findings: Vec<String>,
    /// The group entry passed in was modified and must be written back.
    pub entry_changed: bool,
}

impl DataAudit {
    fn report(&mut self, message: String) {
        warn!("{}", message);
        self.findings.push(message);
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Sanity check of one overview record: the first tab-separated field must
/// be the article number it is stored under.
pub fn audit_overview(overview: &[u8], article: u64) -> bool {
    let first = overview.split(|&b| b == b'\t').next().unwrap_or(&[]);
    std::str::from_utf8(first)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map_or(false, |n| n == article)
}

impl GroupData {
    /// Writes one line per IDX slot: `artnum offset length arrived expires token`.
    pub fn index_dump<W: Write>(&mut self, out: &mut W) -> Result<()> {
        if self.index_region().is_none() {
            self.map_index()?;
        }
        let slots = self.mapped_slots();
        for slot in 0..slots {
            if let Some(entry) = self.slot(slot) {
                writeln!(
                    out,
                    "{} {} {} {} {} {}",
                    self.base + slot,
                    entry.offset(),
                    entry.length(),
                    entry.arrived(),
                    entry.expires(),
                    entry.token()
                )
                .wrap_err("failed to write index dump")?;
            }
        }
        Ok(())
    }

    /// Audits `group`'s files against its group index entry.
    ///
    /// Checks the IDX inode, whole-slot IDX length, every present entry's
    /// bounds and overview number, and the entry's `low` and `count`. With
    /// `fix`, bad slots are cleared, trailing IDX bytes are truncated, and
    /// `entry` is corrected in memory (`entry_changed` is set).
    pub fn audit(root: &Path, group: &str, entry: &mut GroupEntry, fix: bool) -> Result<DataAudit> {
        let mut audit = DataAudit::default();
        let options = DataOptions {
            writable: fix,
            ..DataOptions::default()
        };
        let mut data = GroupData::new(root, group, options)?;
        if let Err(e) = data.open_files() {
            audit.report(format!("cannot open data files for {}: {:#}", group, e));
            return Ok(audit);
        }
        data.base = entry.base();

        if data.index_inode() != entry.index_inode() {
            audit.report(format!(
                "index inode mismatch for {}: {} != {}",
                group,
                data.index_inode(),
                entry.index_inode()
            ));
            if fix {
                entry.set_index_inode(data.index_inode());
                audit.entry_changed = true;
            }
        }

        data.map_index()?;
        data.map_data()?;

        let index_len = data.index_region().map(|r| r.len()).unwrap_or(0);
        let expected = index_len - index_len % INDEX_ENTRY_SIZE;
        if index_len != expected {
            audit.report(format!(
                "{} bytes of trailing trash in {}",
                index_len - expected,
                data.file_path(SUFFIX_INDEX).display()
            ));
            if fix {
                data.unmap_index();
                if let Some(file) = &data.index_file {
                    file.set_len(expected as u64).wrap_err_with(|| {
                        format!("failed to truncate '{}'", data.file_path(SUFFIX_INDEX).display())
                    })?;
                }
                data.map_index()?;
            }
        }

        let data_len = data.data_region().map(|r| r.len() as u64).unwrap_or(0);
        let mut low = 0u64;
        let mut count = 0u64;
        for slot in 0..data.mapped_slots() {
            let index_entry = match data.slot(slot) {
                Some(e) if e.is_present() => e,
                _ => continue,
            };
            let article = entry.base() + slot;

            if let Some(problem) = entry_problem(&data, &index_entry, data_len, article) {
                audit.report(format!("{} for {}:{}", problem, group, article));
                if fix {
                    clear_slot(&data, slot, group, article)?;
                    continue;
                }
            }
            if low == 0 {
                low = article;
            }
            count += 1;
        }

        if data.mapped_slots() != 0 && entry.low() != low {
            audit.report(format!(
                "low water mark incorrect for {}: {} != {}",
                group,
                low,
                entry.low()
            ));
            if fix {
                entry.set_low(low);
                audit.entry_changed = true;
            }
        }
        if entry.count() != count {
            audit.report(format!(
                "count incorrect for {}: {} != {}",
                group,
                count,
                entry.count()
            ));
            if fix {
                entry.set_count(count);
                audit.entry_changed = true;
            }
        }

        data.close();
        Ok(audit)
    }
}

fn entry_problem(data: &GroupData, entry: &IndexEntry, data_len: u64, article: u64) -> Option<String> {
    if entry.offset() > data_len || u64::from(entry.length()) > data_len {
        return Some(format!(
            "offset {} or length {} out of bounds",
            entry.offset(),
            entry.length()
        ));
    }
    if entry.end() > data_len {
        return Some(format!(
            "offset {} plus length {} out of bounds",
            entry.offset(),
            entry.length()
        ));
    }
    let overview = data
        .data_region()
        .and_then(|r| r.slice(entry.offset(), entry.length() as usize))?;
    if !audit_overview(overview, article) {
        return Some("malformed overview data".to_string());
    }
    None
}

fn clear_slot(data: &GroupData, slot: u64, group: &str, article: u64) -> Result<()> {
    let file = match &data.index_file {
        Some(file) => file,
        None => return Ok(()),
    };
    file.write_all_at(
        IndexEntry::empty().as_bytes(),
        slot * INDEX_ENTRY_SIZE as u64,
    )
    .wrap_err_with(|| format!("unable to repair {}:{}", group, article))
}
