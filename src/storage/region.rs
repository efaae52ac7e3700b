//! # Checked File Regions
//!
//! `Region` is the typed view of a file's contents used by the group index
//! and the per-group data files. Every record access goes through
//! [`Region::read`] or [`Region::write`], which bounds-check the offset
//! against the region length before copying a record in or out. Callers
//! never hold a pointer into the mapping.
//!
//! ## Backings
//!
//! ```text
//! Shared(MmapMut)  read/write MAP_SHARED mapping (writable group.index)
//! Mapped(Mmap)     read-only MAP_SHARED mapping (readers, data files)
//! Loaded(Vec<u8>)  whole file read into memory (mmap disabled)
//! Empty            zero-length file, nothing to map
//! ```
//!
//! The `Loaded` backing is the portable fallback: it sees a snapshot of the
//! file at load time and must be reloaded to observe appends, which the
//! group data code does whenever the group index says more data exists.
//!
//! ## Remapping
//!
//! A region never grows in place. When the underlying file is extended the
//! owner drops the region and maps the file again; since every remapping
//! entry point takes `&mut self` on the owner, no record borrowed from the
//! old mapping can outlive it.
//!
//! ## Safety Considerations
//!
//! Files are shared with other processes. Their contents may change under
//! a mapping, but the on-disk protocol never truncates a live file: IDX and
//! DAT are only replaced by rename, and group.index only grows. Reads copy
//! records out (`read_from_bytes`), so a concurrently updated record is seen
//! either before or after the update at field granularity, never as a
//! dangling reference.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// How read-only regions are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Mmap,
    Read,
}

#[derive(Debug)]
enum Backing {
    Empty,
    Shared(MmapMut),
    Mapped(Mmap),
    Loaded(Vec<u8>),
}

#[derive(Debug)]
pub struct Region {
    backing: Backing,
}

impl Region {
    pub fn empty() -> Self {
        Self {
            backing: Backing::Empty,
        }
    }

    /// Maps `file` read/write and shared. `len` must equal the file size.
    pub fn map_shared(file: &File, len: u64, path: &Path) -> Result<Self> {
        if len == 0 {
            return Ok(Self::empty());
        }

        // SAFETY: the mapping may be modified by other processes holding the
        // same file. This is sound for our use because:
        // 1. The file only ever grows, so the mapped range stays backed
        // 2. All access is through read()/write() which bounds-check and copy
        // 3. The mapping is dropped before the owner remaps after growth
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .len(len as usize)
                .map_mut(file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            backing: Backing::Shared(mmap),
        })
    }

    /// Maps or loads `len` bytes of `file` for reading.
    pub fn map_readonly(file: &File, len: u64, mode: MapMode, path: &Path) -> Result<Self> {
        if len == 0 {
            return Ok(Self::empty());
        }

        let backing = match mode {
            MapMode::Mmap => {
                // SAFETY: the mapping is read-only and shared with writers. IDX
                // and DAT files are replaced by rename rather than truncated, so
                // the first `len` bytes stay backed for the life of the mapping.
                let mmap = unsafe {
                    memmap2::MmapOptions::new()
                        .len(len as usize)
                        .map(file)
                        .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
                };
                Backing::Mapped(mmap)
            }
            MapMode::Read => {
                let mut buf = vec![0u8; len as usize];
                file.read_exact_at(&mut buf, 0)
                    .wrap_err_with(|| format!("failed to read '{}'", path.display()))?;
                Backing::Loaded(buf)
            }
        };

        Ok(Self { backing })
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.backing, Backing::Shared(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Empty => &[],
            Backing::Shared(mmap) => &mmap[..],
            Backing::Mapped(mmap) => &mmap[..],
            Backing::Loaded(buf) => &buf[..],
        }
    }

    /// Returns `len` bytes at `offset`, or `None` if the range is not covered.
    pub fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        self.bytes().get(start..end)
    }

    /// Copies the record at `offset` out of the region.
    pub fn read<T: FromBytes>(&self, offset: usize) -> Option<T> {
        let end = offset.checked_add(std::mem::size_of::<T>())?;
        let bytes = self.bytes().get(offset..end)?;
        T::read_from_bytes(bytes).ok()
    }

    /// Copies `value` into the region at `offset`. Requires a shared mapping.
    pub fn write<T: IntoBytes + Immutable + ?Sized>(&mut self, offset: usize, value: &T) -> Result<()> {
        let src = value.as_bytes();
        let len = self.len();
        let mmap = match &mut self.backing {
            Backing::Shared(mmap) => mmap,
            _ => eyre::bail!("cannot write to a read-only region"),
        };

        let end = offset.checked_add(src.len());
        ensure!(
            matches!(end, Some(end) if end <= len),
            "write of {} bytes at offset {} out of bounds (len={})",
            src.len(),
            offset,
            len
        );

        mmap[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Schedules write-back of a modified range without waiting for it.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if let Backing::Shared(mmap) = &self.backing {
            mmap.flush_async_range(offset, len)
                .wrap_err("failed to schedule mmap flush")?;
        }
        Ok(())
    }

    /// Hints that a range will be read soon. No-op for non-mapped backings.
    pub fn prefetch(&self, offset: usize, len: usize) {
        let ptr = match &self.backing {
            Backing::Mapped(mmap) => mmap.as_ptr(),
            Backing::Shared(mmap) => mmap.as_ptr(),
            _ => return,
        };
        let total = self.len();
        if offset >= total {
            return;
        }
        let len = len.min(total - offset);

        // madvise wants a page-aligned start address.
        let page = 4096usize;
        let aligned = offset - offset % page;

        // SAFETY: madvise with MADV_WILLNEED is only a hint. The range
        // [aligned, offset + len) lies within the mapping: offset < total was
        // checked above, len is clamped to total - offset, and aligned <= offset.
        unsafe {
            libc::madvise(
                ptr.add(aligned) as *mut libc::c_void,
                len + (offset - aligned),
                libc::MADV_WILLNEED,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;
    use zerocopy::little_endian::U32;

    fn file_with(path: &Path, contents: &[u8]) -> File {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn empty_file_maps_to_empty_region() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        let file = file_with(&path, b"");

        let region = Region::map_readonly(&file, 0, MapMode::Mmap, &path).unwrap();

        assert!(region.is_empty());
        assert!(region.read::<U32>(0).is_none());
    }

    #[test]
    fn read_mode_and_mmap_mode_see_same_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let file = file_with(&path, b"hello world");

        let mapped = Region::map_readonly(&file, 11, MapMode::Mmap, &path).unwrap();
        let loaded = Region::map_readonly(&file, 11, MapMode::Read, &path).unwrap();

        assert_eq!(mapped.bytes(), loaded.bytes());
        assert_eq!(loaded.slice(6, 5), Some(&b"world"[..]));
    }

    #[test]
    fn slice_out_of_bounds_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let file = file_with(&path, b"abc");

        let region = Region::map_readonly(&file, 3, MapMode::Read, &path).unwrap();

        assert_eq!(region.slice(2, 2), None);
        assert_eq!(region.slice(u64::MAX, 1), None);
    }

    #[test]
    fn shared_write_is_visible_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared");
        let file = file_with(&path, &[0u8; 8]);

        let mut region = Region::map_shared(&file, 8, &path).unwrap();
        region.write(4, &U32::new(0xdead_beef)).unwrap();
        region.flush_range(0, 8).unwrap();

        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, 4).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xdead_beef);
    }

    #[test]
    fn write_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared");
        let file = file_with(&path, &[0u8; 8]);

        let mut region = Region::map_shared(&file, 8, &path).unwrap();

        assert!(region.write(6, &U32::new(1)).is_err());
    }

    #[test]
    fn write_to_readonly_region_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro");
        let file = file_with(&path, &[0u8; 8]);

        let mut region = Region::map_readonly(&file, 8, MapMode::Mmap, &path).unwrap();

        assert!(region.write(0, &U32::new(1)).is_err());
    }
}
