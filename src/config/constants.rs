//! # Format and Tuning Constants
//!
//! Every constant that shapes the on-disk format or a default setting lives
//! here. Format constants are part of the file format: changing any of them
//! produces files that older builds refuse to open (the group index header
//! records the version and hash table size it was created with).
//!
//! ## Dependency Graph
//!
//! ```text
//! TDX_HASH_SIZE (16384 buckets)
//!       │
//!       └─> GROUP_HEADER_SIZE (derived: prefix + 4 bytes per bucket)
//!             Entry N of group.index starts at
//!             GROUP_HEADER_SIZE + N * GROUP_ENTRY_SIZE
//!
//! GROUP_INDEX_EXPAND_BY (1024 entries)
//!       │
//!       └─> group.index grows by this many zeroed entries at a time, all
//!           pushed onto the free list
//!
//! INDEX_ENTRY_SIZE (48 bytes)
//!       │
//!       └─> <group>.IDX slot for article A lives at (A - base) * size
//!
//! INDEX_BASE_SLOP (128)
//!       │
//!       └─> first write of article A sets base = max(1, A - SLOP)
//!
//! DEFAULT_CACHE_SIZE (128 groups)
//!       │
//!       └─> FDS_PER_GROUP (2) descriptors each; clamped by RLIMIT_NOFILE
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `GROUP_HEADER_SIZE == GROUP_HEADER_PREFIX_SIZE + TDX_HASH_SIZE * 4`
//! 2. `GROUP_INDEX_EXPAND_BY` fits in a bucket pointer (`i32`)
//! 3. `DEFAULT_CACHE_SIZE >= READ_ONLY_CACHE_SIZE`

// ============================================================================
// GROUP INDEX FORMAT
// Layout of group.index: header prefix, bucket table, entry array
// ============================================================================

/// Name of the group index file inside the overview directory.
pub const GROUP_INDEX_FILE: &str = "group.index";

/// Magic bytes at offset 0 of group.index.
pub const GROUP_INDEX_MAGIC: [u8; 16] = *b"TDX GROUP INDEX\0";

/// Format version recorded in the group.index header.
pub const GROUP_INDEX_VERSION: u32 = 1;

/// Number of hash buckets in the group index.
/// Fixed at creation and recorded in the header.
pub const TDX_HASH_SIZE: usize = 16 * 1024;

/// Size of the fixed header fields that precede the bucket table.
pub const GROUP_HEADER_PREFIX_SIZE: usize = 32;

/// Total header size: prefix plus one `i32` per bucket.
pub const GROUP_HEADER_SIZE: usize = GROUP_HEADER_PREFIX_SIZE + TDX_HASH_SIZE * 4;

/// Size of one persisted group entry.
pub const GROUP_ENTRY_SIZE: usize = 96;

/// Number of entries appended each time the free list runs dry.
pub const GROUP_INDEX_EXPAND_BY: usize = 1024;

/// Sentinel for an empty bucket or the end of a chain.
pub const GROUP_LOC_NONE: i32 = -1;

const _: () = assert!(
    GROUP_HEADER_SIZE == GROUP_HEADER_PREFIX_SIZE + TDX_HASH_SIZE * 4,
    "GROUP_HEADER_SIZE derivation mismatch"
);

const _: () = assert!(
    GROUP_INDEX_EXPAND_BY < i32::MAX as usize,
    "GROUP_INDEX_EXPAND_BY must fit in a GroupLoc"
);

// ============================================================================
// GROUP DATA FORMAT
// Per-group <group>.IDX (fixed stride) and <group>.DAT (append only)
// ============================================================================

/// Size of one persisted per-article index entry.
pub const INDEX_ENTRY_SIZE: usize = 48;

/// Pad below the first article written to an empty group.
/// Absorbs moderate out-of-order arrival without an immediate repack.
pub const INDEX_BASE_SLOP: u64 = 128;

/// Size of an opaque storage token.
pub const TOKEN_SIZE: usize = 18;

/// Size of the group name hash.
pub const GROUP_HASH_SIZE: usize = 16;

/// Live index file suffix.
pub const SUFFIX_INDEX: &str = "IDX";

/// Live data file suffix.
pub const SUFFIX_DATA: &str = "DAT";

/// Suffix appended to IDX/DAT while a pack or rebuild writes new files.
pub const SUFFIX_NEW: &str = "-NEW";

/// Suffix the live index is moved to while a rebuild swaps files.
pub const SUFFIX_BACKUP: &str = "-BAK";

/// Permission bits for newly created data files and directories.
pub const DATA_FILE_MODE: u32 = 0o664;

/// Permission bits for newly created group directories.
pub const DATA_DIR_MODE: u32 = 0o775;

// ============================================================================
// OPEN-FILE CACHE
// Bounds on concurrently open group data handles
// ============================================================================

/// Default number of cached group handles for a writer.
pub const DEFAULT_CACHE_SIZE: usize = 128;

/// Cache size used for read-only opens.
/// Every operation reopens, so a reader never holds more than one group.
pub const READ_ONLY_CACHE_SIZE: usize = 1;

/// Descriptors held by one open group (IDX and DAT).
pub const FDS_PER_GROUP: u64 = 2;

/// Number of times insertion waits for a referenced entry to be released.
pub const CACHE_EVICT_RETRIES: u32 = 20;

/// Pause between eviction retries in milliseconds.
pub const CACHE_EVICT_RETRY_DELAY_MS: u64 = 5;

const _: () = assert!(
    DEFAULT_CACHE_SIZE >= READ_ONLY_CACHE_SIZE,
    "DEFAULT_CACHE_SIZE must be >= READ_ONLY_CACHE_SIZE"
);
