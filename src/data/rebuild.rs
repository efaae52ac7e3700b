//! # Pack and Rebuild
//!
//! The only ways a group's files change other than by appending. Both
//! write complete replacement files under temporary names, fsync them, and
//! move them into place with `rename`, so a live name always refers to a
//! complete file:
//!
//! ```text
//! pack (new lower base, DAT untouched)
//!   write  <group>.IDX-NEW   old slots shifted by (old_base - new_base)
//!   rename <group>.IDX-NEW -> <group>.IDX
//!
//! rebuild (retained articles only)
//!   write  <group>.IDX-NEW, <group>.DAT-NEW
//!   rename <group>.IDX     -> <group>.IDX-BAK
//!   rename <group>.IDX-NEW -> <group>.IDX
//!   rename <group>.DAT-NEW -> <group>.DAT
//!   unlink <group>.IDX-BAK
//! ```
//!
//! A crash between steps leaves either the old pair or the new pair live.
//! A failed rename during rebuild moves IDX-BAK back into place.

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, warn};

use crate::config::{INDEX_ENTRY_SIZE, SUFFIX_BACKUP, SUFFIX_DATA, SUFFIX_INDEX, SUFFIX_NEW};
use crate::storage::{file_inode, remove_if_exists};

use super::{group_path, index_base, open_file, with_suffix, DataOptions, GroupData};

fn new_suffix(kind: &str) -> String {
    format!("{}{}", kind, SUFFIX_NEW)
}

impl GroupData {
    /// Writes `<group>.IDX-NEW` with a base low enough to hold `artnum`.
    ///
    /// On success the handle's `base` and `index_inode` describe the new
    /// file, which is not yet live; [`GroupData::pack_finish`] moves it into
    /// place.
    pub fn pack_start(&mut self, artnum: u64) -> Result<()> {
        ensure!(
            self.options.writable,
            "cannot pack read-only group '{}'",
            self.path.display()
        );
        ensure!(
            self.base > artnum,
            "pack of '{}' for article {} is unnecessary (base {})",
            self.path.display(),
            artnum,
            self.base
        );

        let base = index_base(artnum);
        let delta = self.base - base;
        let new_path = self.file_path(&new_suffix(SUFFIX_INDEX));

        let result = (|| -> Result<u64> {
            remove_if_exists(&new_path)?;
            let file = open_file(&new_path, true, false)?;
            let inode = file_inode(&file, &new_path)?;

            self.unmap_index();
            self.map_index()?;
            let old = self.index.as_ref().map(|r| r.bytes()).unwrap_or(&[]);
            file.write_all_at(old, delta * INDEX_ENTRY_SIZE as u64)
                .wrap_err_with(|| format!("failed to write '{}'", new_path.display()))?;
            file.sync_all()
                .wrap_err_with(|| format!("failed to sync '{}'", new_path.display()))?;
            Ok(inode)
        })();

        match result {
            Ok(inode) => {
                debug!(
                    path = %self.path.display(),
                    old_base = self.base,
                    new_base = base,
                    "packed group index"
                );
                self.base = base;
                self.index_inode = inode;
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&new_path) {
                    warn!(error = %cleanup, "cannot remove partial pack file");
                }
                Err(e)
            }
        }
    }

    /// Renames `<group>.IDX-NEW` over `<group>.IDX` and reopens it.
    pub fn pack_finish(&mut self) -> Result<()> {
        ensure!(
            self.options.writable,
            "cannot pack read-only group '{}'",
            self.path.display()
        );
        let new_path = self.file_path(&new_suffix(SUFFIX_INDEX));
        let live_path = self.file_path(SUFFIX_INDEX);

        if let Err(e) = fs::rename(&new_path, &live_path) {
            if let Err(cleanup) = remove_if_exists(&new_path) {
                warn!(error = %cleanup, "cannot remove pack file after failed rename");
            }
            return Err(e).wrap_err_with(|| {
                format!(
                    "failed to rename '{}' to '{}'",
                    new_path.display(),
                    live_path.display()
                )
            });
        }
        self.open_index_file(SUFFIX_INDEX)
    }

    /// Runs both pack phases, restoring the handle's base and inode on failure.
    pub fn pack(&mut self, artnum: u64) -> Result<()> {
        let (old_base, old_inode) = (self.base, self.index_inode);
        self.pack_start(artnum)?;
        if let Err(e) = self.pack_finish() {
            self.base = old_base;
            self.index_inode = old_inode;
            return Err(e);
        }
        Ok(())
    }

    /// Opens fresh `-NEW` files for a rebuild of `group`.
    ///
    /// The live files are untouched until [`GroupData::rebuild_finish`].
    pub fn rebuild_start(root: &Path, group: &str, options: DataOptions) -> Result<GroupData> {
        ensure!(options.writable, "cannot rebuild '{}' read-only", group);
        GroupData::delete_files(root, group, SUFFIX_NEW)?;

        let mut data = GroupData::new(root, group, options)?;
        let opened = data
            .open_index_file(&new_suffix(SUFFIX_INDEX))
            .and_then(|_| data.open_data_file(&new_suffix(SUFFIX_DATA)));
        if let Err(e) = opened {
            data.close();
            GroupData::delete_files(root, group, SUFFIX_NEW)?;
            return Err(e.wrap_err(format!("cannot start rebuild of '{}'", group)));
        }
        Ok(data)
    }

    /// Swaps the `-NEW` files of `group` into place.
    pub fn rebuild_finish(root: &Path, group: &str) -> Result<()> {
        let base = group_path(root, group)?;
        let idx = with_suffix(&base, SUFFIX_INDEX);
        let dat = with_suffix(&base, SUFFIX_DATA);
        let new_idx = with_suffix(&base, &new_suffix(SUFFIX_INDEX));
        let new_dat = with_suffix(&base, &new_suffix(SUFFIX_DATA));
        let bak_idx = with_suffix(&base, &format!("{}{}", SUFFIX_INDEX, SUFFIX_BACKUP));

        let saved = match fs::rename(&idx, &bak_idx) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(e).wrap_err_with(|| {
                    format!("failed to rename '{}' to '{}'", idx.display(), bak_idx.display())
                })
            }
        };

        let swapped = fs::rename(&new_idx, &idx)
            .wrap_err_with(|| format!("failed to rename '{}' to '{}'", new_idx.display(), idx.display()))
            .and_then(|_| {
                fs::rename(&new_dat, &dat).wrap_err_with(|| {
                    format!("failed to rename '{}' to '{}'", new_dat.display(), dat.display())
                })
            });

        if let Err(e) = swapped {
            if saved {
                if let Err(restore) = fs::rename(&bak_idx, &idx) {
                    warn!(path = %bak_idx.display(), error = %restore, "cannot restore old index");
                }
            }
            return Err(e);
        }

        if saved {
            if let Err(e) = remove_if_exists(&bak_idx) {
                warn!(path = %bak_idx.display(), error = %e, "cannot remove index backup");
            }
        }
        debug!(group, "rebuilt group data");
        Ok(())
    }

    /// Discards a rebuild that will not be finished.
    pub fn rebuild_abort(mut self, root: &Path, group: &str) -> Result<()> {
        self.close();
        GroupData::delete_files(root, group, SUFFIX_NEW)
    }
}
