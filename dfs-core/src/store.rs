//! Local blob store: one file per key at `root / segments / file_name`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::path::{PathKey, PathTransform};

/// Store error. No retries happen at this layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("blob {key} ended after {received} of {expected} bytes")]
    Incomplete {
        key: String,
        expected: u64,
        received: u64,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Suffix counter for in-progress writes, so concurrent writers never share a temp file.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Blob storage rooted at a directory this node fully owns.
///
/// Writes to distinct keys need no coordination. Concurrent writes to the same
/// key are not serialized; the last writer wins.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    transform: PathTransform,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        Self {
            root: root.into(),
            transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        self.transform.transform(key)
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.path_key(key).full_path_under(&self.root)
    }

    /// True iff the resolved path exists and is a regular file.
    pub async fn has(&self, key: &str) -> bool {
        fs::metadata(self.full_path(key))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Stream `reader` into the key's file, replacing any previous content.
    /// Returns the number of bytes written.
    ///
    /// Bytes land in a temp file next to the blob and are renamed into place
    /// once complete; a failed write leaves the previous content untouched.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_inner(key, reader, None).await
    }

    /// Like [`Store::write`], but the blob is only replaced if exactly `size`
    /// bytes arrive; a shorter stream yields [`StoreError::Incomplete`].
    pub async fn write_exact<R>(
        &self,
        key: &str,
        reader: &mut R,
        size: u64,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_inner(key, reader, Some(size)).await
    }

    async fn write_inner<R>(
        &self,
        key: &str,
        reader: &mut R,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let pk = self.path_key(key);
        let dir = pk.dir_under(&self.root);
        fs::create_dir_all(&dir).await?;
        let full = dir.join(&pk.file_name);
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = dir.join(format!("{}.{seq}.tmp", pk.file_name));

        let res = match (copy_to_file(&tmp, reader).await, expected) {
            (Ok(n), Some(size)) if n != size => Err(StoreError::Incomplete {
                key: key.to_string(),
                expected: size,
                received: n,
            }),
            (Ok(n), _) => fs::rename(&tmp, &full)
                .await
                .map(|()| n)
                .map_err(StoreError::from),
            (Err(e), _) => Err(e),
        };
        match res {
            Ok(n) => {
                tracing::debug!(key = %key, path = %full.display(), bytes = n, "blob written");
                Ok(n)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp).await {
                    if rm.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = %tmp.display(), error = %rm, "failed to remove temp file");
                    }
                }
                Err(e)
            }
        }
    }

    /// Open an independent read handle positioned at the start of the blob.
    pub async fn read(&self, key: &str) -> Result<File, StoreError> {
        if !self.has(key).await {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(File::open(self.full_path(key)).await?)
    }

    /// Stored length in bytes.
    pub async fn size(&self, key: &str) -> Result<u64, StoreError> {
        match fs::metadata(self.full_path(key)).await {
            Ok(m) if m.is_file() => Ok(m.len()),
            Ok(_) => Err(StoreError::NotFound(key.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the whole first-segment shard for `key`.
    ///
    /// Shard-scoped: other keys whose digest shares the first segment go too.
    /// Succeeds when nothing was stored.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let pk = self.path_key(key);
        let shard = self.root.join(pk.first_segment());
        remove_dir_if_exists(&shard).await?;
        tracing::debug!(key = %key, shard = %shard.display(), "shard deleted");
        Ok(())
    }

    /// Remove everything under the root, including the root itself.
    pub async fn clear(&self) -> Result<(), StoreError> {
        remove_dir_if_exists(&self.root).await
    }
}

async fn copy_to_file<R>(path: &Path, reader: &mut R) -> Result<u64, StoreError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = File::create(path).await?;
    let n = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    Ok(n)
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn new_store(dir: &tempfile::TempDir) -> Store {
        Store::new(dir.path().join("store"), PathTransform::default())
    }

    async fn read_all(store: &Store, key: &str) -> Vec<u8> {
        let mut f = store.read(key).await.unwrap();
        let mut out = Vec::new();
        f.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        let data = b"some jpg bytes";
        let n = s.write("momsbestpicture", &mut &data[..]).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert!(s.has("momsbestpicture").await);
        assert_eq!(read_all(&s, "momsbestpicture").await, data);
        assert_eq!(s.size("momsbestpicture").await.unwrap(), data.len() as u64);

        let expected = dir
            .path()
            .join("store/68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff")
            .join("6804429f74181a63c50c3d81d733a12f14a353ff");
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        s.write("k", &mut &b"a much longer first version"[..])
            .await
            .unwrap();
        s.write("k", &mut &b"short"[..]).await.unwrap();
        assert_eq!(read_all(&s, "k").await, b"short");
    }

    #[tokio::test]
    async fn short_write_keeps_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        s.write("k", &mut &b"GOOD-ORIGINAL-CONTENT"[..]).await.unwrap();
        let err = s.write_exact("k", &mut &b"abc"[..], 10).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Incomplete {
                expected: 10,
                received: 3,
                ..
            }
        ));
        assert_eq!(read_all(&s, "k").await, b"GOOD-ORIGINAL-CONTENT");

        // No temp file is left behind next to the blob.
        let blob_dir = s.path_key("k").dir_under(s.root());
        let mut entries = tokio::fs::read_dir(&blob_dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from(s.path_key("k").file_name)]);
    }

    #[tokio::test]
    async fn short_write_of_new_key_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        assert!(s.write_exact("fresh", &mut &b"ab"[..], 5).await.is_err());
        assert!(!s.has("fresh").await);
        assert_eq!(s.write_exact("fresh", &mut &b"abcde"[..], 5).await.unwrap(), 5);
        assert_eq!(read_all(&s, "fresh").await, b"abcde");
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        s.write("momsspecials", &mut &b"some jpg files"[..])
            .await
            .unwrap();
        s.delete("momsspecials").await.unwrap();
        assert!(!s.has("momsspecials").await);
        assert!(matches!(
            s.read("momsspecials").await,
            Err(StoreError::NotFound(_))
        ));
        let shard = dir.path().join("store").join(s.path_key("momsspecials").first_segment());
        assert!(!shard.exists());
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        s.delete("never-written").await.unwrap();
        s.clear().await.unwrap();
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        assert!(!s.has("nope").await);
        assert!(matches!(s.read("nope").await, Err(StoreError::NotFound(k)) if k == "nope"));
        assert!(matches!(s.size("nope").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn fifty_keys_no_cross_contamination() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        for i in 0..50 {
            let key = format!("foo_{i}");
            let data = format!("payload number {i}").into_bytes();
            s.write(&key, &mut data.as_slice()).await.unwrap();
        }
        for i in 0..50 {
            let key = format!("foo_{i}");
            assert!(s.has(&key).await);
            assert_eq!(read_all(&s, &key).await, format!("payload number {i}").into_bytes());
        }
    }

    #[tokio::test]
    async fn concurrent_readers_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        s.write("shared", &mut &b"0123456789"[..]).await.unwrap();
        let mut a = s.read("shared").await.unwrap();
        let mut b = s.read("shared").await.unwrap();
        let mut buf_a = [0u8; 4];
        a.read_exact(&mut buf_a).await.unwrap();
        let mut all_b = Vec::new();
        b.read_to_end(&mut all_b).await.unwrap();
        assert_eq!(&buf_a, b"0123");
        assert_eq!(all_b, b"0123456789");
    }

    #[tokio::test]
    async fn clear_removes_root() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        s.write("a", &mut &b"1"[..]).await.unwrap();
        s.write("b", &mut &b"2"[..]).await.unwrap();
        s.clear().await.unwrap();
        assert!(!s.root().exists());
        assert!(!s.has("a").await);
    }

    #[tokio::test]
    async fn directory_at_path_is_not_a_blob() {
        let dir = tempfile::tempdir().unwrap();
        let s = new_store(&dir);
        let pk = s.path_key("k");
        tokio::fs::create_dir_all(pk.full_path_under(s.root()))
            .await
            .unwrap();
        assert!(!s.has("k").await);
    }
}
