//! Key to on-disk location: SHA-1 of the key, hex, sliced into fixed-width directory segments.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

/// Default width (hex chars) of one directory segment. 40 / 5 = 8 levels.
pub const DEFAULT_SHARD_WIDTH: usize = 5;

/// Sharded location derived from a key. Recomputed on every access, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub path_segments: Vec<String>,
    pub file_name: String,
}

impl PathKey {
    /// Segments joined with `/`, e.g. `68044/29f74/...`.
    pub fn path_name(&self) -> String {
        self.path_segments.join("/")
    }

    /// First directory segment: the unit `Store::delete` removes.
    pub fn first_segment(&self) -> &str {
        self.path_segments
            .first()
            .map(String::as_str)
            .unwrap_or(self.file_name.as_str())
    }

    /// Directory holding the file, relative to `root`.
    pub fn dir_under(&self, root: &Path) -> PathBuf {
        let mut dir = root.to_path_buf();
        dir.extend(&self.path_segments);
        dir
    }

    /// `root / seg1 / ... / segN / file_name`.
    pub fn full_path_under(&self, root: &Path) -> PathBuf {
        self.dir_under(root).join(&self.file_name)
    }
}

/// Content-addressable path transform. Pure: same key, same `PathKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathTransform {
    shard_width: usize,
}

impl PathTransform {
    /// A width of 0 falls back to [`DEFAULT_SHARD_WIDTH`].
    pub fn new(shard_width: usize) -> Self {
        let shard_width = if shard_width == 0 {
            DEFAULT_SHARD_WIDTH
        } else {
            shard_width
        };
        Self { shard_width }
    }

    pub fn shard_width(&self) -> usize {
        self.shard_width
    }

    pub fn transform(&self, key: &str) -> PathKey {
        let digest = Sha1::digest(key.as_bytes());
        let file_name = hex::encode(digest);
        // Hex is ASCII, so byte chunks are valid char boundaries.
        let path_segments = file_name
            .as_bytes()
            .chunks(self.shard_width)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        PathKey {
            path_segments,
            file_name,
        }
    }
}

impl Default for PathTransform {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_WIDTH)
    }
}

/// Default transform as a plain function.
pub fn cas_path_transform(key: &str) -> PathKey {
    PathTransform::default().transform(key)
}
