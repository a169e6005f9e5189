//! Key-to-path derivation.
//!
//! A key's on-disk location is a pure function of the key itself: the full
//! SHA-1 digest of the key (hex-encoded) is the filename, and the same hex
//! string split into fixed-width segments forms the nested shard
//! directories. No index exists anywhere; lookup re-derives the path.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

/// Default width of one shard path segment, in hex characters.
///
/// A 40-character SHA-1 hex digest splits into 8 segments of 5.
pub const DEFAULT_SEGMENT_LEN: usize = 5;

/// Scheme for deriving storage paths from keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathScheme {
    segment_len: usize,
}

impl Default for PathScheme {
    fn default() -> Self {
        Self {
            segment_len: DEFAULT_SEGMENT_LEN,
        }
    }
}

impl PathScheme {
    /// Create a scheme with the given segment width.
    ///
    /// A width of zero would produce no path segments at all, so it is
    /// clamped up to one character.
    pub fn new(segment_len: usize) -> Self {
        Self {
            segment_len: segment_len.max(1),
        }
    }

    /// Derive the storage location for `key`.
    ///
    /// Deterministic: identical keys always yield identical paths.
    pub fn path_for(&self, key: &str) -> PathKey {
        let hash = hex::encode(Sha1::digest(key.as_bytes()));

        let segments = hash.len().div_ceil(self.segment_len);
        let mut pathname = String::with_capacity(hash.len() + segments);
        for (i, chunk) in hash.as_bytes().chunks(self.segment_len).enumerate() {
            if i > 0 {
                pathname.push('/');
            }
            // hex output is pure ASCII
            pathname.push_str(std::str::from_utf8(chunk).expect("hex digest is ASCII"));
        }

        PathKey {
            filename: hash,
            pathname,
        }
    }
}

/// The derived location of one key: shard directories plus filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Full hex digest of the key; the leaf file's name.
    pub filename: String,
    /// The digest split into shard segments, `/`-joined.
    pub pathname: String,
}

impl PathKey {
    /// Directory holding the leaf file, under `root`.
    pub fn dir_path(&self, root: &Path) -> PathBuf {
        root.join(&self.pathname)
    }

    /// Full path of the leaf file, under `root`.
    pub fn full_path(&self, root: &Path) -> PathBuf {
        root.join(&self.pathname).join(&self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_key_derives_known_path() {
        let scheme = PathScheme::default();
        let path_key = scheme.path_for("mybestpicture");

        assert_eq!(path_key.filename, "be17b32c2870b1c0c73b59949db6a3be7814dd23");
        assert_eq!(
            path_key.pathname,
            "be17b/32c28/70b1c/0c73b/59949/db6a3/be781/4dd23"
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let scheme = PathScheme::default();
        let a = scheme.path_for("somekey");
        let b = scheme.path_for("somekey");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_keys_get_distinct_paths() {
        let scheme = PathScheme::default();
        assert_ne!(scheme.path_for("one"), scheme.path_for("two"));
    }

    #[test]
    fn segment_width_is_configurable() {
        let scheme = PathScheme::new(8);
        let path_key = scheme.path_for("mybestpicture");

        let segments: Vec<&str> = path_key.pathname.split('/').collect();
        assert_eq!(segments.len(), 5);
        assert!(segments.iter().all(|s| s.len() == 8));
        assert_eq!(segments.concat(), path_key.filename);
    }

    #[test]
    fn zero_segment_width_is_clamped() {
        let scheme = PathScheme::new(0);
        let path_key = scheme.path_for("k");
        assert!(!path_key.pathname.is_empty());
    }

    #[test]
    fn full_path_nests_under_root() {
        let scheme = PathScheme::default();
        let path_key = scheme.path_for("mybestpicture");
        let full = path_key.full_path(Path::new("/tmp/store"));
        assert!(full.starts_with("/tmp/store/be17b/32c28"));
        assert!(full.ends_with("be17b32c2870b1c0c73b59949db6a3be7814dd23"));
    }
}
