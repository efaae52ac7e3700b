//! # Overview Builder
//!
//! `OverviewBuilder` collects the settings an overview instance needs and
//! produces an `OverviewConfig`, or opens a `Tradindexed` directly.
//!
//! ## Configuration Options
//!
//! | Option     | Default | Description                                        |
//! |------------|---------|----------------------------------------------------|
//! | path       | (none)  | Overview root holding group.index and group files  |
//! | cache_size | 128     | Maximum open groups; clamped by `RLIMIT_NOFILE`    |
//! | mmap       | true    | Map group files; `false` reads them into memory    |
//! | nfs_reader | false   | Recheck file sizes and handles on every lookup     |
//! | cutoff     | false   | Reject articles below a group's low water mark     |
//!
//! ## Usage
//!
//! ```ignore
//! let overview = Tradindexed::builder()
//!     .path("/var/spool/news/overview")
//!     .cache_size(64)
//!     .open(OpenMode::ReadWrite)?;
//! ```
//!
//! A read-only open always uses a cache of one group, whatever `cache_size`
//! says.

use std::path::{Path, PathBuf};

use eyre::Result;

use crate::config::DEFAULT_CACHE_SIZE;

use super::{OpenMode, Tradindexed};

/// Settings for one overview instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverviewConfig {
    pub path: PathBuf,
    pub cache_size: usize,
    pub mmap: bool,
    pub nfs_reader: bool,
    pub cutoff: bool,
}

impl OverviewConfig {
    /// Default settings for an overview rooted at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache_size: DEFAULT_CACHE_SIZE,
            mmap: true,
            nfs_reader: false,
            cutoff: false,
        }
    }
}

/// Builder for [`OverviewConfig`] and [`Tradindexed`].
#[derive(Debug, Default)]
pub struct OverviewBuilder {
    path: Option<PathBuf>,
    cache_size: Option<usize>,
    mmap: Option<bool>,
    nfs_reader: Option<bool>,
    cutoff: Option<bool>,
}

impl OverviewBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the overview root directory. Created on first writable open.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the maximum number of groups kept open at once.
    pub fn cache_size(mut self, groups: usize) -> Self {
        self.cache_size = Some(groups);
        self
    }

    /// Chooses between mapping group files and reading them into memory.
    pub fn mmap(mut self, enabled: bool) -> Self {
        self.mmap = Some(enabled);
        self
    }

    /// Enables the reader behavior needed when the overview lives on NFS:
    /// the group index size and open file handles are rechecked on every
    /// lookup instead of only when a lookup falls off the mapped range.
    pub fn nfs_reader(mut self, enabled: bool) -> Self {
        self.nfs_reader = Some(enabled);
        self
    }

    /// Sets whether `add` drops articles numbered below the group's low
    /// water mark.
    pub fn cutoff(mut self, enabled: bool) -> Self {
        self.cutoff = Some(enabled);
        self
    }

    pub fn get_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get_cache_size(&self) -> Option<usize> {
        self.cache_size
    }

    pub fn get_mmap(&self) -> Option<bool> {
        self.mmap
    }

    pub fn get_nfs_reader(&self) -> Option<bool> {
        self.nfs_reader
    }

    pub fn get_cutoff(&self) -> Option<bool> {
        self.cutoff
    }

    /// Produces the configuration, filling unset options with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if no path was given.
    pub fn build(self) -> Result<OverviewConfig> {
        let path = self
            .path
            .ok_or_else(|| eyre::eyre!("overview path not specified: call .path() first"))?;
        let defaults = OverviewConfig::new(&path);
        Ok(OverviewConfig {
            path,
            cache_size: self.cache_size.unwrap_or(defaults.cache_size),
            mmap: self.mmap.unwrap_or(defaults.mmap),
            nfs_reader: self.nfs_reader.unwrap_or(defaults.nfs_reader),
            cutoff: self.cutoff.unwrap_or(defaults.cutoff),
        })
    }

    /// Builds the configuration and opens an overview instance in `mode`.
    pub fn open(self, mode: OpenMode) -> Result<Tradindexed> {
        let overview = Tradindexed::new(self.build()?);
        overview.open(mode)?;
        Ok(overview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builder_path_sets_path() {
        let builder = OverviewBuilder::new().path("/tmp/overview");

        assert_eq!(builder.get_path(), Some(Path::new("/tmp/overview")));
    }

    #[test]
    fn builder_cache_size_sets_value() {
        let builder = OverviewBuilder::new().path("/tmp/overview").cache_size(16);

        assert_eq!(builder.get_cache_size(), Some(16));
    }

    #[test]
    fn build_fills_defaults() {
        let config = OverviewBuilder::new().path("/tmp/overview").build().unwrap();

        assert_eq!(config, OverviewConfig::new("/tmp/overview"));
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert!(config.mmap);
        assert!(!config.cutoff);
    }

    #[test]
    fn build_keeps_explicit_settings() {
        let config = OverviewBuilder::new()
            .path("/tmp/overview")
            .mmap(false)
            .nfs_reader(true)
            .cutoff(true)
            .build()
            .unwrap();

        assert!(!config.mmap);
        assert!(config.nfs_reader);
        assert!(config.cutoff);
    }

    #[test]
    fn build_without_path_fails() {
        let result = OverviewBuilder::new().build();

        match result {
            Err(e) => assert!(e.to_string().contains("overview path not specified")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn open_creates_group_index() {
        let dir = tempdir().unwrap();

        let overview = OverviewBuilder::new()
            .path(dir.path())
            .open(OpenMode::ReadWrite)
            .unwrap();

        assert!(overview.is_open());
        assert!(dir.path().join("group.index").exists());
    }
}
