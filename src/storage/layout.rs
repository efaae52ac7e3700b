//! # On-Disk Record Layout
//!
//! Fixed-size, pointer-free records shared by every other module. All
//! integers are little-endian (`zerocopy::little_endian`) and every struct is
//! `Unaligned`, so a record can be copied out of any byte offset of a mapped
//! file with `read_from_bytes`.
//!
//! ## group.index
//!
//! ```text
//! Offset  Size     Description
//! 0       16       Magic: "TDX GROUP INDEX\0"
//! 16      4        Format version
//! 20      4        Hash table size (buckets)
//! 24      4        Free list head (GroupLoc, -1 = empty)
//! 28      4        Reserved
//! 32      4*16384  Bucket heads (GroupLoc each, -1 = empty)
//! 65568   96*N     GroupEntry array, indexed by GroupLoc
//! ```
//!
//! ### GroupEntry (96 bytes)
//! ```text
//! Offset  Size  Description
//! 0       16    Group name hash (all zero = free or deleted)
//! 16      8     High water mark
//! 24      8     Low water mark
//! 32      8     Base article number of the current IDX file
//! 40      8     Live article count
//! 48      8     Deletion time (unix seconds, 0 = live)
//! 56      8     Inode of the IDX file base/high/low describe
//! 64      4     Next entry in bucket chain or free list
//! 68      1     Status flag from the active file
//! 69      27    Reserved
//! ```
//!
//! ## <group>.IDX
//!
//! Flat array of IndexEntry, slot N describing article `base + N`.
//!
//! ### IndexEntry (48 bytes)
//! ```text
//! Offset  Size  Description
//! 0       8     Offset of the overview record in <group>.DAT
//! 8       4     Length of the record (0 = slot empty)
//! 12      8     Arrival time (unix seconds)
//! 20      8     Expiration time (unix seconds, 0 = none)
//! 28      18    Storage token
//! 46      2     Reserved
//! ```

use std::fmt;

use eyre::{ensure, Result};
use zerocopy::little_endian::{I32, I64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    GROUP_ENTRY_SIZE, GROUP_HASH_SIZE, GROUP_HEADER_PREFIX_SIZE, GROUP_INDEX_MAGIC,
    GROUP_INDEX_VERSION, GROUP_LOC_NONE, INDEX_ENTRY_SIZE, TDX_HASH_SIZE, TOKEN_SIZE,
};

use super::hash::{GroupHash, Token};

/// Record number of an entry in the group index.
///
/// Persisted as an `i32` with `-1` meaning "none"; in memory the sentinel
/// becomes `Option<GroupLoc>`. A location is only an index: it must be
/// validated against the current entry count before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupLoc(u32);

impl GroupLoc {
    pub fn new(recno: u32) -> Self {
        Self(recno)
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    pub fn to_raw(loc: Option<Self>) -> i32 {
        match loc {
            Some(loc) => loc.0 as i32,
            None => GROUP_LOC_NONE,
        }
    }

    pub fn recno(&self) -> u32 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GroupLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct GroupIndexHeader {
    magic: [u8; 16],
    version: U32,
    hash_size: U32,
    freelist: I32,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<GroupIndexHeader>() == GROUP_HEADER_PREFIX_SIZE);

impl GroupIndexHeader {
    pub fn new() -> Self {
        Self {
            magic: GROUP_INDEX_MAGIC,
            version: U32::new(GROUP_INDEX_VERSION),
            hash_size: U32::new(TDX_HASH_SIZE as u32),
            freelist: I32::new(GROUP_LOC_NONE),
            reserved: [0u8; 4],
        }
    }

    /// Checks the identifying fields of a header read from disk.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic == GROUP_INDEX_MAGIC,
            "invalid magic bytes in group index"
        );
        ensure!(
            self.version.get() == GROUP_INDEX_VERSION,
            "unsupported group index version: {} (expected {})",
            self.version.get(),
            GROUP_INDEX_VERSION
        );
        ensure!(
            self.hash_size.get() as usize == TDX_HASH_SIZE,
            "group index hash table has {} buckets (expected {})",
            self.hash_size.get(),
            TDX_HASH_SIZE
        );
        Ok(())
    }

    pub fn freelist(&self) -> Option<GroupLoc> {
        GroupLoc::from_raw(self.freelist.get())
    }

    pub fn set_freelist(&mut self, loc: Option<GroupLoc>) {
        self.freelist = I32::new(GroupLoc::to_raw(loc));
    }

    pub fn freelist_raw(&self) -> i32 {
        self.freelist.get()
    }
}

impl Default for GroupIndexHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct GroupEntry {
    hash: [u8; GROUP_HASH_SIZE],
    high: U64,
    low: U64,
    base: U64,
    count: U64,
    deleted: I64,
    index_inode: U64,
    next: I32,
    flag: u8,
    reserved: [u8; 27],
}

const _: () = assert!(std::mem::size_of::<GroupEntry>() == GROUP_ENTRY_SIZE);

impl GroupEntry {
    /// A free slot: cleared hash, not deleted, chained to `next`.
    pub fn free(next: Option<GroupLoc>) -> Self {
        Self {
            hash: [0u8; GROUP_HASH_SIZE],
            high: U64::new(0),
            low: U64::new(0),
            base: U64::new(0),
            count: U64::new(0),
            deleted: I64::new(0),
            index_inode: U64::new(0),
            next: I32::new(GroupLoc::to_raw(next)),
            flag: 0,
            reserved: [0u8; 27],
        }
    }

    zerocopy_accessors! {
        high: u64,
        low: u64,
        base: u64,
        count: u64,
        deleted: i64,
        index_inode: u64,
    }

    pub fn hash(&self) -> GroupHash {
        GroupHash::from_bytes(self.hash)
    }

    pub fn set_hash(&mut self, hash: GroupHash) {
        self.hash = *hash.as_bytes();
    }

    pub fn next(&self) -> Option<GroupLoc> {
        GroupLoc::from_raw(self.next.get())
    }

    pub fn next_raw(&self) -> i32 {
        self.next.get()
    }

    pub fn set_next(&mut self, next: Option<GroupLoc>) {
        self.next = I32::new(GroupLoc::to_raw(next));
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flag = flag;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.get() != 0
    }

    /// True for an entry describing a group that currently exists.
    pub fn is_live(&self) -> bool {
        !self.is_deleted() && !self.hash().is_empty()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexEntry {
    offset: U64,
    length: U32,
    arrived: I64,
    expires: I64,
    token: [u8; TOKEN_SIZE],
    reserved: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<IndexEntry>() == INDEX_ENTRY_SIZE);

impl IndexEntry {
    pub fn new(offset: u64, length: u32, arrived: i64, expires: i64, token: Token) -> Self {
        Self {
            offset: U64::new(offset),
            length: U32::new(length),
            arrived: I64::new(arrived),
            expires: I64::new(expires),
            token: *token.as_bytes(),
            reserved: [0u8; 2],
        }
    }

    /// An absent slot.
    pub fn empty() -> Self {
        Self::new(0, 0, 0, 0, Token::default())
    }

    zerocopy_getters! {
        offset: u64,
        length: u32,
        arrived: i64,
        expires: i64,
    }

    pub fn token(&self) -> Token {
        Token::new(self.token)
    }

    pub fn is_present(&self) -> bool {
        self.length.get() != 0
    }

    /// Exclusive end of the record in the data file.
    pub fn end(&self) -> u64 {
        self.offset.get().saturating_add(u64::from(self.length.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_loc_round_trips_sentinel() {
        assert_eq!(GroupLoc::from_raw(-1), None);
        assert_eq!(GroupLoc::to_raw(None), -1);
        assert_eq!(GroupLoc::from_raw(7), Some(GroupLoc::new(7)));
        assert_eq!(GroupLoc::to_raw(Some(GroupLoc::new(7))), 7);
    }

    #[test]
    fn group_loc_rejects_other_negative_values() {
        assert_eq!(GroupLoc::from_raw(-5), None);
    }

    #[test]
    fn header_new_validates() {
        GroupIndexHeader::new().validate().unwrap();
    }

    #[test]
    fn header_with_wrong_magic_fails_validation() {
        let mut bytes = GroupIndexHeader::new().as_bytes().to_vec();
        bytes[0] = b'X';
        let header = GroupIndexHeader::read_from_bytes(&bytes).unwrap();

        assert!(header.validate().is_err());
    }

    #[test]
    fn header_new_has_empty_freelist() {
        assert_eq!(GroupIndexHeader::new().freelist(), None);
    }

    #[test]
    fn group_entry_free_is_not_live() {
        let entry = GroupEntry::free(Some(GroupLoc::new(3)));

        assert!(!entry.is_live());
        assert!(!entry.is_deleted());
        assert_eq!(entry.next(), Some(GroupLoc::new(3)));
    }

    #[test]
    fn group_entry_accessors_store_little_endian() {
        let mut entry = GroupEntry::free(None);
        entry.set_high(0x0102_0304);
        entry.set_hash(GroupHash::of("example.test"));

        let bytes = entry.as_bytes();

        assert_eq!(&bytes[16..20], &[0x04, 0x03, 0x02, 0x01]);
        assert!(entry.is_live());
    }

    #[test]
    fn index_entry_empty_is_absent() {
        assert!(!IndexEntry::empty().is_present());
    }

    #[test]
    fn index_entry_end_is_offset_plus_length() {
        let entry = IndexEntry::new(100, 20, 0, 0, Token::default());

        assert_eq!(entry.end(), 120);
        assert!(entry.is_present());
    }
}
