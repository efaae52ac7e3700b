//! Field accessors for the on-disk records in [`crate::storage::layout`].
//!
//! `GroupEntry` and `IndexEntry` store every integer as a
//! `zerocopy::little_endian` wrapper so the files read the same on any host.
//! These macros expand to the plain-integer methods callers use instead.
//!
//! ```ignore
//! impl GroupEntry {
//!     zerocopy_accessors! {
//!         high: u64,
//!         deleted: i64,
//!     }
//! }
//!
//! // entry.high(), entry.set_high(n), entry.deleted(), entry.set_deleted(t)
//! ```
//!
//! `IndexEntry` is written whole through `IndexEntry::new` and only needs
//! [`zerocopy_getters!`].

/// Getter and `set_` pair for `U64`/`I64` fields of a mutable group record.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    (@impl $field:ident, i64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> i64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: i64) {
                self.$field = ::zerocopy::little_endian::I64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

/// Read-only getters for little-endian fields of an index slot.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
