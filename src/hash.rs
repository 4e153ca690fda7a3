//! Full hashes and hash prefixes.
//!
//! A *full hash* is the 32-byte SHA-256 digest of a canonicalized URL
//! expression. A *hash prefix* is its first 4 to 32 bytes; prefixes are the
//! unit stored in the local database and the unit sent to the service during
//! a lookup. Prefixes order lexicographically, which is the order the update
//! protocol and the checksum computation rely on.

use std::fmt;

use bytes::Bytes;
use ring::digest;

/// The byte length of a full hash.
pub const FULL_HASH_LEN: usize = 32;

/// The minimum byte length of a stored hash prefix.
pub const MIN_PREFIX_LEN: usize = 4;

//----------- FullHash ---------------------------------------------------------

/// The SHA-256 digest of a canonicalized URL expression.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FullHash(Bytes);

impl FullHash {
    /// Hash a canonicalized URL expression.
    pub fn from_pattern(pattern: &str) -> Self {
        let digest = digest::digest(&digest::SHA256, pattern.as_bytes());
        Self(Bytes::copy_from_slice(digest.as_ref()))
    }

    /// Construct a full hash from raw bytes.
    ///
    /// Returns `None` unless `bytes` is exactly 32 bytes long.
    pub fn from_bytes(bytes: Bytes) -> Option<Self> {
        (bytes.len() == FULL_HASH_LEN).then_some(Self(bytes))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether `prefix` is a prefix of this hash.
    pub fn has_prefix(&self, prefix: &HashPrefix) -> bool {
        self.0.starts_with(prefix.as_bytes())
    }

    /// The prefix formed by the first `len` bytes of this hash.
    ///
    /// ## Panics
    ///
    /// Panics if `len` is not a valid prefix length.
    pub fn prefix(&self, len: usize) -> HashPrefix {
        HashPrefix::new(self.0.slice(..len)).expect("32-byte hashes prefix to any valid length")
    }
}

impl fmt::Display for FullHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

//----------- HashPrefix -------------------------------------------------------

/// The first 4 to 32 bytes of a full hash.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct HashPrefix(Bytes);

impl HashPrefix {
    /// Construct a prefix from raw bytes.
    ///
    /// Returns `None` unless the length is within 4 to 32 bytes.
    pub fn new(bytes: Bytes) -> Option<Self> {
        (MIN_PREFIX_LEN..=FULL_HASH_LEN)
            .contains(&bytes.len())
            .then_some(Self(bytes))
    }

    /// The raw prefix bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The length of this prefix in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for HashPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

//----------- Digests ----------------------------------------------------------

/// An incremental SHA-256 over a sequence of byte strings.
///
/// Used for the per-list checksum, which is defined over the concatenation of
/// the sorted prefix array.
pub struct Checksum {
    context: digest::Context,
}

impl Checksum {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self {
            context: digest::Context::new(&digest::SHA256),
        }
    }

    /// Feed one byte string.
    pub fn update(&mut self, bytes: &[u8]) {
        self.context.update(bytes);
    }

    /// Finish, producing the 32-byte digest.
    pub fn finish(self) -> [u8; FULL_HASH_LEN] {
        let digest = self.context.finish();
        let mut out = [0u8; FULL_HASH_LEN];
        out.copy_from_slice(digest.as_ref());
        out
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{Checksum, FullHash, HashPrefix};

    #[test]
    fn known_digest() {
        // SHA-256("abc"), the FIPS 180-2 test vector.
        let hash = FullHash::from_pattern("abc");
        assert_eq!(
            hash.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        );
    }

    #[test]
    fn prefix_bounds() {
        assert!(HashPrefix::new(Bytes::from_static(b"abc")).is_none());
        assert!(HashPrefix::new(Bytes::from_static(b"abcd")).is_some());
        assert!(HashPrefix::new(Bytes::copy_from_slice(&[0u8; 32])).is_some());
        assert!(HashPrefix::new(Bytes::copy_from_slice(&[0u8; 33])).is_none());
    }

    #[test]
    fn prefix_matching() {
        let hash = FullHash::from_pattern("example.test/");
        let prefix = hash.prefix(4);
        assert!(hash.has_prefix(&prefix));
        assert!(hash.has_prefix(&hash.prefix(32)));

        let other = FullHash::from_pattern("other.test/");
        assert!(!other.has_prefix(&prefix));
    }

    #[test]
    fn checksum_matches_concatenation() {
        let mut split = Checksum::new();
        split.update(b"abcd");
        split.update(b"efgh");

        let mut joined = Checksum::new();
        joined.update(b"abcdefgh");

        assert_eq!(split.finish(), joined.finish());
    }
}
