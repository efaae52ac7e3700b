//! # Group Name Hashes and Storage Tokens
//!
//! Two fixed-size identifiers appear in the persisted records:
//!
//! - [`GroupHash`]: 128-bit hash of a newsgroup name. The group index keys
//!   every entry by this value and the open-file cache uses it as its map
//!   key. Computed as the first 16 bytes of SHA-256 over the name.
//! - [`Token`]: opaque 18-byte article storage token. Produced by the article
//!   storage layer; this crate stores and returns it uninterpreted.
//!
//! Both have a textual form used by the dump and import tooling:
//!
//! ```text
//! GroupHash: 32 uppercase hex digits      5B1F0C...9A
//! Token:     @ + 36 uppercase hex digits + @
//! ```

use std::fmt;

use eyre::{ensure, Result};
use sha2::{Digest, Sha256};

use crate::config::{GROUP_HASH_SIZE, TDX_HASH_SIZE, TOKEN_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct GroupHash([u8; GROUP_HASH_SIZE]);

impl GroupHash {
    pub const EMPTY: GroupHash = GroupHash([0u8; GROUP_HASH_SIZE]);

    pub fn of(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; GROUP_HASH_SIZE];
        bytes.copy_from_slice(&digest[..GROUP_HASH_SIZE]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; GROUP_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GROUP_HASH_SIZE] {
        &self.0
    }

    /// A cleared hash marks a deleted or never-used entry.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; GROUP_HASH_SIZE]
    }

    /// Bucket of the group index hash table this hash chains into.
    pub fn bucket(&self) -> usize {
        let prefix = u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        prefix as usize % TDX_HASH_SIZE
    }
}

impl fmt::Display for GroupHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token([u8; TOKEN_SIZE]);

impl Token {
    pub fn new(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }

    /// Parses the `@HEX@` form produced by `Display`.
    pub fn from_text(text: &str) -> Result<Self> {
        let inner = text
            .strip_prefix('@')
            .and_then(|rest| rest.strip_suffix('@'))
            .ok_or_else(|| eyre::eyre!("token '{}' is not wrapped in '@'", text))?;

        ensure!(
            inner.is_ascii() && inner.len() == TOKEN_SIZE * 2,
            "token '{}' has {} hex digits, expected {}",
            text,
            inner.len(),
            TOKEN_SIZE * 2
        );

        let mut bytes = [0u8; TOKEN_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &inner[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| eyre::eyre!("token '{}' contains invalid hex '{}'", text, pair))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("@")?;
        for byte in &self.0 {
            write!(f, "{:02X}", byte)?;
        }
        f.write_str("@")
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_hash_is_stable_for_same_name() {
        assert_eq!(GroupHash::of("comp.lang.rust"), GroupHash::of("comp.lang.rust"));
        assert_ne!(GroupHash::of("comp.lang.rust"), GroupHash::of("comp.lang.c"));
    }

    #[test]
    fn group_hash_of_name_is_never_empty() {
        assert!(!GroupHash::of("example.test").is_empty());
        assert!(GroupHash::EMPTY.is_empty());
    }

    #[test]
    fn group_hash_bucket_is_within_table() {
        for name in ["a", "b.c", "news.announce.newgroups", "alt.test"] {
            assert!(GroupHash::of(name).bucket() < TDX_HASH_SIZE);
        }
    }

    #[test]
    fn group_hash_display_is_uppercase_hex() {
        let text = GroupHash::of("example.test").to_string();

        assert_eq!(text.len(), GROUP_HASH_SIZE * 2);
        assert!(text.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn token_text_form_parses_back() {
        let mut bytes = [0u8; TOKEN_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i * 13) as u8;
        }
        let token = Token::new(bytes);

        let text = token.to_string();

        assert!(text.starts_with('@') && text.ends_with('@'));
        assert_eq!(Token::from_text(&text).unwrap(), token);
    }

    #[test]
    fn token_from_text_rejects_malformed_input() {
        assert!(Token::from_text("0102").is_err());
        assert!(Token::from_text("@0102@").is_err());
        assert!(Token::from_text(&format!("@{}@", "ZZ".repeat(TOKEN_SIZE))).is_err());
    }
}
