//! Content-addressable disk storage.
//!
//! Files live at `root/<shard segments>/<digest>`, derived from the key by
//! [`PathScheme`]. Writes stream into a temp file next to the final
//! location and are renamed into place, so a torn write never surfaces as
//! a complete file. The store keeps no in-memory state and no locks:
//! concurrent writes to distinct keys touch distinct paths, concurrent
//! writes to the same key are last-writer-wins at the rename.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead, AsyncWriteExt};

mod paths;

pub use paths::{PathKey, PathScheme, DEFAULT_SEGMENT_LEN};

/// Content-addressable file store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    scheme: PathScheme,
}

impl Store {
    /// Create a store over `root`. The directory is created lazily on the
    /// first write.
    pub fn new(root: impl Into<PathBuf>, scheme: PathScheme) -> Self {
        Self {
            root: root.into(),
            scheme,
        }
    }

    /// The storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derive the storage location for `key`.
    pub fn path_for(&self, key: &str) -> PathKey {
        self.scheme.path_for(key)
    }

    /// Stream all of `reader` into the file for `key`.
    ///
    /// Creates missing shard directories, writes to a temp file, then
    /// renames over the final path. Returns the number of bytes written.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_inner(key, reader, None).await
    }

    /// Like [`Store::write`], but fails with `UnexpectedEof` if `reader`
    /// yields fewer than `expected` bytes. The short payload is discarded
    /// before the error returns, never renamed into place.
    pub async fn write_sized<R>(&self, key: &str, reader: &mut R, expected: u64) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.write_inner(key, reader, Some(expected)).await
    }

    async fn write_inner<R>(
        &self,
        key: &str,
        reader: &mut R,
        expected: Option<u64>,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path_key = self.scheme.path_for(key);
        let dir = path_key.dir_path(&self.root);
        fs::create_dir_all(&dir).await?;

        let target = dir.join(&path_key.filename);
        let tmp = temp_path_for(&target);

        let mut file = File::create(&tmp).await?;
        let written = match io::copy(reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected {
            if written != expected {
                drop(file);
                let _ = fs::remove_file(&tmp).await;
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("short stream for key {key}: got {written} of {expected} bytes"),
                ));
            }
        }

        file.flush().await?;
        drop(file);

        replace_file(&tmp, &target).await?;
        Ok(written)
    }

    /// Open the file for `key`. Returns the file plus its length so
    /// callers can frame the bytes for the wire.
    ///
    /// Fails with `NotFound` if the key was never written.
    pub async fn read(&self, key: &str) -> io::Result<(File, u64)> {
        let path = self.scheme.path_for(key).full_path(&self.root);
        let file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Existence check only; no content validation.
    pub async fn has(&self, key: &str) -> bool {
        let path = self.scheme.path_for(key).full_path(&self.root);
        fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Remove the file for `key` and prune shard directories left empty.
    ///
    /// Deletion is leaf-grained: sibling keys sharing shard prefixes are
    /// untouched.
    pub async fn delete(&self, key: &str) -> io::Result<()> {
        let path = self.scheme.path_for(key).full_path(&self.root);
        fs::remove_file(&path).await?;

        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // remove_dir refuses non-empty directories, which ends the walk
            if fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// Remove the entire storage root. Teardown and tests only.
    pub async fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("object");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    target.with_file_name(format!("{file_name}.tmp.{}.{}", std::process::id(), nanos))
}

async fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::remove_file(to).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::rename(from, to).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn new_store(dir: &TempDir) -> Store {
        Store::new(dir.path().join("cas"), PathScheme::default())
    }

    async fn read_all(store: &Store, key: &str) -> Vec<u8> {
        let (mut file, len) = store.read(key).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len() as u64, len);
        buf
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        let data = b"some jpg bytes";
        let written = store.write("myspecialpicture", &mut &data[..]).await.unwrap();
        assert_eq!(written, data.len() as u64);

        assert_eq!(read_all(&store, "myspecialpicture").await, data);
    }

    #[tokio::test]
    async fn has_tracks_writes_and_deletes() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        assert!(!store.has("myspecialpicture").await);
        store
            .write("myspecialpicture", &mut &b"some jpg bytes"[..])
            .await
            .unwrap();
        assert!(store.has("myspecialpicture").await);

        store.delete("myspecialpicture").await.unwrap();
        assert!(!store.has("myspecialpicture").await);
    }

    #[tokio::test]
    async fn read_of_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        let err = store.read("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_prunes_empty_shard_directories() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("somekey", &mut &b"x"[..]).await.unwrap();
        store.delete("somekey").await.unwrap();

        let mut entries = tokio::fs::read_dir(store.root()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_keeps_siblings_that_share_no_leaf() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("one", &mut &b"first"[..]).await.unwrap();
        store.write("two", &mut &b"second"[..]).await.unwrap();

        store.delete("one").await.unwrap();
        assert!(!store.has("one").await);
        assert!(store.has("two").await);
        assert_eq!(read_all(&store, "two").await, b"second");
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("k", &mut &b"old"[..]).await.unwrap();
        store.write("k", &mut &b"new bytes"[..]).await.unwrap();

        assert_eq!(read_all(&store, "k").await, b"new bytes");
    }

    #[tokio::test]
    async fn write_sized_rejects_short_streams() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        let err = store
            .write_sized("k", &mut &b"only five"[..], 100)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        assert!(!store.has("k").await);
    }

    #[tokio::test]
    async fn clear_removes_the_root() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);

        store.write("k", &mut &b"bytes"[..]).await.unwrap();
        store.clear().await.unwrap();

        assert!(!store.root().exists());
        // clearing an already-missing root is fine
        store.clear().await.unwrap();
    }
}
