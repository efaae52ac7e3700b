//! # Configuration Module
//!
//! Centralizes the fixed parameters of the on-disk format and the defaults
//! used when opening an overview store. Values that depend on each other are
//! co-located and checked at compile time.
//!
//! Runtime settings (overview directory, cache size, mmap policy, cutoff) live
//! in [`crate::overview::OverviewConfig`] and are built with
//! [`crate::overview::OverviewBuilder`]; this module only holds the constants
//! those settings default to.
//!
//! ## Module Organization
//!
//! - [`constants`]: file names, format sizes, and tunable defaults

pub mod constants;
pub use constants::*;
