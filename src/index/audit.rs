//! # Group Index Audit
//!
//! Offline consistency checking for `group.index`, plus the textual dump used
//! by `tdx-util`. The audit runs in three passes:
//!
//! 1. Structure, under the header write lock: every bucket chain and the free
//!    list are walked, marking each entry reached. Out-of-range links, loops,
//!    misplaced entries, tombstones, and live entries on the free list are
//!    reported. Entries reached by neither are orphans.
//! 2. Membership, against an active file when one is given: groups missing
//!    from the index, entries with no active group, and flag mismatches.
//! 3. Data, per active group: [`GroupData::audit`] checks the group's files
//!    against its entry.
//!
//! With `fix`, every finding is repaired in the same pass. Repairs only ever
//! splice links, push entries onto the free list, or re-add entries to their
//! correct bucket; no entry contents other than links and water marks are
//! rewritten.

use std::io::{BufRead, Write};

use eyre::{eyre, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use tracing::warn;

use crate::data::GroupData;
use crate::storage::{file_len, unix_now, GroupEntry, GroupHash, GroupLoc, LockKind};

use super::{index_file_size, GroupIndex};
use crate::config::TDX_HASH_SIZE;

/// One line of an active file: `name high low flag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveGroup {
    pub name: String,
    pub high: u64,
    pub low: u64,
    pub flag: u8,
}

/// Parses an active file. Blank lines and lines starting with `#` are
/// skipped.
pub fn parse_active<R: BufRead>(reader: R) -> Result<Vec<ActiveGroup>> {
    let mut groups = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.wrap_err("failed to read active file")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let parsed = match fields.as_slice() {
            [name, high, low, flag, ..] => {
                let flag = flag.bytes().next();
                match (high.parse::<u64>(), low.parse::<u64>(), flag) {
                    (Ok(high), Ok(low), Some(flag)) => Some(ActiveGroup {
                        name: name.to_string(),
                        high,
                        low,
                        flag,
                    }),
                    _ => None,
                }
            }
            _ => None,
        };
        let group =
            parsed.ok_or_else(|| eyre!("malformed active file line {}: '{}'", lineno + 1, line))?;
        groups.push(group);
    }
    Ok(groups)
}

/// Findings of a group index audit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexAudit {
    pub findings: Vec<String>,
}

impl IndexAudit {
    fn report(&mut self, message: String) {
        warn!("{}", message);
        self.findings.push(message);
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Where the link to the entry being examined is stored.
#[derive(Debug, Clone, Copy)]
enum Link {
    Bucket(usize),
    Entry(GroupLoc),
    Freelist,
}

/// Writes one entry as `name high low base count flag deleted inode`.
pub fn print_entry<W: Write>(out: &mut W, name: &str, entry: &GroupEntry) -> Result<()> {
    writeln!(
        out,
        "{} {} {} {} {} {} {} {}",
        name,
        entry.high(),
        entry.low(),
        entry.base(),
        entry.count(),
        flag_char(entry.flag()),
        entry.deleted(),
        entry.index_inode()
    )
    .wrap_err("failed to write group entry")
}

fn flag_char(flag: u8) -> char {
    if flag.is_ascii_graphic() {
        flag as char
    } else {
        '?'
    }
}

impl GroupIndex {
    /// Prints every entry reachable from a bucket, in bucket order. Names
    /// come from `names`; entries whose hash matches none print as the hash
    /// in hex.
    pub fn dump<W: Write>(&mut self, out: &mut W, names: &[String]) -> Result<()> {
        let names: HashMap<GroupHash, &str> = names
            .iter()
            .map(|name| (GroupHash::of(name), name.as_str()))
            .collect();
        self.maybe_remap(usize::MAX)?;

        for bucket in 0..TDX_HASH_SIZE {
            let mut current = self.bucket_head(bucket);
            let mut steps = 0usize;
            while let Some(loc) = current {
                let entry = match self.entry(loc) {
                    Some(entry) => entry,
                    None => break,
                };
                let hash = entry.hash();
                let hex = hash.to_string();
                let name = names.get(&hash).copied().unwrap_or(hex.as_str());
                print_entry(out, name, &entry)?;
                steps += 1;
                if entry.next() == Some(loc) || steps > self.count {
                    break;
                }
                current = entry.next();
            }
        }
        Ok(())
    }

    fn set_link(&mut self, link: Link, target: Option<GroupLoc>) -> Result<()> {
        match link {
            Link::Bucket(bucket) => self.set_bucket(bucket, target),
            Link::Entry(loc) => {
                self.update_entry(loc, |entry| entry.set_next(target))?;
                Ok(())
            }
            Link::Freelist => self.set_freelist(target),
        }
    }

    fn push_free(&mut self, loc: GroupLoc) -> Result<()> {
        let head = self
            .header()
            .ok_or_else(|| eyre!("group index '{}' has no header", self.path.display()))?
            .freelist();
        self.write_entry(loc, &GroupEntry::free(head))?;
        self.set_freelist(Some(loc))
    }

    fn push_bucket(&mut self, loc: GroupLoc) -> Result<()> {
        let entry = self
            .entry(loc)
            .ok_or_else(|| eyre!("group entry {} out of range", loc))?;
        let bucket = entry.hash().bucket();
        let head = self.bucket_head(bucket);
        self.update_entry(loc, |entry| entry.set_next(head))?;
        self.set_bucket(bucket, Some(loc))
    }

    /// Checks (and with `fix`, repairs) the index structure, and with
    /// `active`, its membership and every listed group's data files.
    pub fn audit(&mut self, fix: bool, active: Option<&[ActiveGroup]>) -> Result<IndexAudit> {
        let mut audit = IndexAudit::default();
        if fix && !self.is_writable() {
            return Err(eyre!("cannot fix read-only group index '{}'", self.path.display()));
        }

        {
            let _lock = if fix { Some(self.lock_header()?) } else { None };
            self.audit_structure(fix, &mut audit)?;
        }

        if let Some(groups) = active {
            self.audit_membership(fix, groups, &mut audit)?;
            self.audit_groups(fix, groups, &mut audit)?;
        }
        Ok(audit)
    }

    fn audit_structure(&mut self, fix: bool, audit: &mut IndexAudit) -> Result<()> {
        self.maybe_remap(usize::MAX)?;

        let size = file_len(&self.file, &self.path)?;
        let expected = index_file_size(self.count);
        if size != expected {
            audit.report(format!(
                "{} bytes of trailing trash in {}",
                size - expected,
                self.path.display()
            ));
            if fix {
                self.store = super::Store::Direct;
                self.file
                    .set_len(expected)
                    .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))?;
                self.remap()?;
            }
        }

        let mut reached = vec![false; self.count];
        let mut relink = Vec::new();
        let mut reclaim = Vec::new();

        for bucket in 0..TDX_HASH_SIZE {
            let mut link = Link::Bucket(bucket);
            let mut raw = self.bucket_raw(bucket);
            while raw != -1 {
                let loc = match GroupLoc::from_raw(raw).filter(|loc| loc.index() < self.count) {
                    Some(loc) => loc,
                    None => {
                        audit.report(format!("entry {} out of range in bucket {}", raw, bucket));
                        if fix {
                            self.set_link(link, None)?;
                        }
                        break;
                    }
                };
                if reached[loc.index()] {
                    audit.report(format!("entry {} reached twice from bucket {}", loc, bucket));
                    if fix {
                        self.set_link(link, None)?;
                    }
                    break;
                }
                reached[loc.index()] = true;

                let entry = self
                    .entry(loc)
                    .ok_or_else(|| eyre!("group entry {} out of range", loc))?;
                let next = entry.next();
                let misplaced = entry.is_live() && entry.hash().bucket() != bucket;
                if entry.is_live() && !misplaced {
                    link = Link::Entry(loc);
                    raw = entry.next_raw();
                    continue;
                }

                if misplaced {
                    audit.report(format!("entry {} in wrong bucket {}", loc, bucket));
                } else if entry.is_deleted() {
                    audit.report(format!("deleted entry {} in bucket {}", loc, bucket));
                } else {
                    audit.report(format!("free entry {} in bucket {}", loc, bucket));
                }
                if entry.is_deleted() && !entry.hash().is_empty() {
                    audit.report(format!("deleted entry {} still has a hash", loc));
                }

                if fix {
                    self.set_link(link, next)?;
                    if misplaced {
                        relink.push(loc);
                    } else {
                        reclaim.push(loc);
                    }
                } else {
                    link = Link::Entry(loc);
                }
                raw = GroupLoc::to_raw(next);
            }
        }

        let mut link = Link::Freelist;
        let mut raw = self
            .header()
            .ok_or_else(|| eyre!("group index '{}' has no header", self.path.display()))?
            .freelist_raw();
        while raw != -1 {
            let loc = match GroupLoc::from_raw(raw).filter(|loc| loc.index() < self.count) {
                Some(loc) => loc,
                None => {
                    audit.report(format!("free list entry {} out of range", raw));
                    if fix {
                        self.set_link(link, None)?;
                    }
                    break;
                }
            };
            if reached[loc.index()] {
                audit.report(format!("free list entry {} reached twice", loc));
                if fix {
                    self.set_link(link, None)?;
                }
                break;
            }
            reached[loc.index()] = true;

            let entry = self
                .entry(loc)
                .ok_or_else(|| eyre!("group entry {} out of range", loc))?;
            if entry.is_live() {
                audit.report(format!("live entry {} on free list", loc));
                if fix {
                    self.set_link(link, entry.next())?;
                    relink.push(loc);
                    raw = entry.next_raw();
                    continue;
                }
            }
            link = Link::Entry(loc);
            raw = entry.next_raw();
        }

        for (recno, seen) in reached.iter().enumerate() {
            if *seen {
                continue;
            }
            let loc = GroupLoc::new(recno as u32);
            audit.report(format!("entry {} is unreachable", loc));
            if !fix {
                continue;
            }
            match self.entry(loc) {
                Some(entry) if entry.is_live() => relink.push(loc),
                _ => self.push_free(loc)?,
            }
        }

        for loc in reclaim {
            self.push_free(loc)?;
        }
        for loc in relink {
            self.push_bucket(loc)?;
        }
        Ok(())
    }

    fn audit_membership(
        &mut self,
        fix: bool,
        groups: &[ActiveGroup],
        audit: &mut IndexAudit,
    ) -> Result<()> {
        let mut listed = HashSet::with_capacity(groups.len());
        for group in groups {
            listed.insert(GroupHash::of(&group.name));
            match self.lookup(&group.name)? {
                None => {
                    audit.report(format!("group {} missing from index", group.name));
                    if fix {
                        self.add(&group.name, group.low, group.high, group.flag)?;
                    }
                }
                Some((loc, entry)) if entry.flag() != group.flag => {
                    audit.report(format!(
                        "flag mismatch for {}: {} != {}",
                        group.name,
                        flag_char(entry.flag()),
                        flag_char(group.flag)
                    ));
                    if fix {
                        self.update_entry(loc, |e| e.set_flag(group.flag))?;
                    }
                }
                Some(_) => {}
            }
        }

        let _lock = if fix { Some(self.lock_header()?) } else { None };
        for recno in 0..self.count {
            let loc = GroupLoc::new(recno as u32);
            let entry = match self.entry(loc) {
                Some(entry) if entry.is_live() => entry,
                _ => continue,
            };
            if listed.contains(&entry.hash()) {
                continue;
            }
            audit.report(format!("group {} not in active file", entry.hash()));
            if fix {
                self.update_entry(loc, |e| {
                    e.set_deleted(unix_now().max(1));
                    e.set_hash(GroupHash::EMPTY);
                })?;
            }
        }
        Ok(())
    }

    fn audit_groups(&mut self, fix: bool, groups: &[ActiveGroup], audit: &mut IndexAudit) -> Result<()> {
        for group in groups {
            let loc = match self.find(&group.name)? {
                Some(loc) => loc,
                None => continue,
            };
            let _lock = if fix {
                Some(self.lock_group(loc, LockKind::Write)?)
            } else {
                None
            };
            let mut entry = match self.entry(loc) {
                Some(entry) => entry,
                None => continue,
            };
            let data = GroupData::audit(&self.root, &group.name, &mut entry, fix)?;
            audit.findings.extend(data.findings);
            if data.entry_changed {
                self.write_entry(loc, &entry)?;
            }
        }
        Ok(())
    }
}
