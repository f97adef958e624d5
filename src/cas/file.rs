use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{error, info, trace};
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags, ResolveFlags};
use tokio::sync::RwLock;

use super::{Blob, Deletable, Error, Existable, Fetchable, PredecessorFindable, Pushable, Resolvable, Taggable};
use crate::digest::{BasicDescriptor, Descriptor, Digest};
use crate::graph;

const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
const UNPACK_ANNOTATION: &str = "io.deis.oras.content.unpack";
const UNPACKED_DIGEST_ANNOTATION: &str = "io.deis.oras.content.digest";

#[derive(Debug, Clone)]
pub struct Options {
    pub disable_overwrite: bool,
    pub allow_path_traversal_on_write: bool,
    pub ignore_no_name: bool,
    pub force_cas: bool,
    pub skip_unpack: bool,
    pub tar_reproducible: bool,
    pub fallback_limit: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            disable_overwrite: false,
            allow_path_traversal_on_write: false,
            ignore_no_name: false,
            force_cas: false,
            skip_unpack: false,
            tar_reproducible: false,
            fallback_limit: 4 * 1024 * 1024 * 1024,
        }
    }
}

struct Dirs {
    root: OwnedFd,
    root_path: PathBuf,
    blobs: OwnedFd,
}

/// Directory-backed CAS: named artifacts live at their title annotation path relative to
/// root, everything else falls back to a hidden digest-keyed subtree (mirroring the
/// `sha256:foo` -> `sha256/foo` layout used by on-disk OCI image directories).
#[derive(Clone)]
pub struct FileStore {
    dirs: Arc<Dirs>,
    options: Options,
    tags: Arc<RwLock<std::collections::HashMap<String, Descriptor>>>,
    predecessors: Arc<RwLock<std::collections::HashMap<BasicDescriptor, Vec<Descriptor>>>>,
    closed: Arc<AtomicBool>,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>, options: Options) -> Result<Self, Error> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root_fd = rustix::fs::open(
            root,
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        let blobs = open_or_create_subdir(&root_fd, "blobs")?;
        Ok(FileStore {
            dirs: Arc::new(Dirs {
                root: root_fd,
                root_path: root.to_path_buf(),
                blobs,
            }),
            options,
            tags: Default::default(),
            predecessors: Default::default(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    fn named_path(&self, descriptor: &Descriptor) -> Option<&str> {
        descriptor.annotations.get(TITLE_ANNOTATION).map(|s| s.as_str())
    }

    fn resolve_named(&self, name: &str) -> Result<PathBuf, Error> {
        let candidate = self.dirs.root_path.join(name);
        if self.options.allow_path_traversal_on_write {
            return Ok(candidate);
        }
        // reject escapes without relying on the path existing yet: resolve lexically.
        let mut depth: i64 = 0;
        for component in Path::new(name).components() {
            use std::path::Component::*;
            match component {
                ParentDir => depth -= 1,
                Normal(_) => depth += 1,
                CurDir => {}
                RootDir | Prefix(_) => {
                    return Err(Error::PathTraversalDisallowed(name.to_string()));
                }
            }
            if depth < 0 {
                return Err(Error::PathTraversalDisallowed(name.to_string()));
            }
        }
        Ok(candidate)
    }

    fn blob_key(digest: &Digest) -> String {
        digest.to_string().replacen(':', "/", 1)
    }

    async fn write_fallback(&self, digest: &Digest, data: &[u8]) -> Result<(), Error> {
        if data.len() as u64 > self.options.fallback_limit {
            return Err(Error::InvalidArgument(format!(
                "blob {digest} is {} bytes, over fallback_limit {}",
                data.len(),
                self.options.fallback_limit
            )));
        }
        let key = Self::blob_key(digest);
        let (algo, _) = key.split_once('/').unwrap();
        match rustix::fs::mkdirat(&self.dirs.blobs, algo, Mode::from_bits_truncate(0o755)) {
            Ok(()) | Err(rustix::io::Errno::EXIST) => {}
            Err(e) => return Err(e.into()),
        }
        let tmp = format!("{key}_tmp");
        let fd = rustix::fs::openat2(
            &self.dirs.blobs,
            &tmp,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
            Mode::from_bits_truncate(0o644),
            ResolveFlags::BENEATH,
        )?;
        {
            let mut file = std::fs::File::from(fd);
            file.write_all(data)?;
        }
        rustix::fs::renameat(&self.dirs.blobs, &tmp, &self.dirs.blobs, &key)?;
        Ok(())
    }

    fn read_fallback(&self, digest: &Digest) -> Result<Option<Vec<u8>>, Error> {
        let key = Self::blob_key(digest);
        match rustix::fs::openat2(
            &self.dirs.blobs,
            &key,
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
            ResolveFlags::BENEATH,
        ) {
            Ok(fd) => {
                let mut file = std::fs::File::from(fd);
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                Ok(Some(buf))
            }
            Err(rustix::io::Errno::NOENT) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `Ok(true)` when `path` already holds exactly `digest`'s content, so the
    /// caller can skip the write. A same-name collision with *different* content is a
    /// `DuplicateName`, distinct from `OverwriteDisallowed` (which fires regardless of
    /// content, before this check, when overwrites are disabled outright).
    fn check_named_collision(&self, path: &Path, digest: &Digest) -> Result<bool, Error> {
        if self.options.disable_overwrite && path.exists() {
            return Err(Error::OverwriteDisallowed);
        }
        if !path.exists() {
            return Ok(false);
        }
        let existing = std::fs::read(path)?;
        if Digest::sha256(&existing) == *digest {
            return Ok(true);
        }
        Err(Error::DuplicateName(path.display().to_string()))
    }

    fn write_named(&self, path: &Path, data: &[u8], digest: &Digest) -> Result<(), Error> {
        if self.check_named_collision(path, digest)? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp_write");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Packs a directory tree into gzipped tar, optionally zeroing mtimes/uids for a
    /// byte-deterministic result, returning (compressed bytes, sha-256 of the uncompressed tar).
    pub fn pack_directory(&self, dir: &Path) -> Result<(Vec<u8>, Digest), Error> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            if self.options.tar_reproducible {
                builder.mode(tar::HeaderMode::Deterministic);
            }
            builder.append_dir_all(".", dir)?;
            builder.finish()?;
        }
        let inner_digest = Digest::sha256(&tar_bytes);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes)?;
        let gz = encoder.finish()?;
        Ok((gz, inner_digest))
    }

    fn unpack_directory(&self, dest: &Path, gz: &[u8], expected_inner: &Digest) -> Result<(), Error> {
        let mut decoder = GzDecoder::new(Cursor::new(gz));
        let mut tar_bytes = Vec::new();
        decoder.read_to_end(&mut tar_bytes)?;
        if !expected_inner
            .matches(&tar_bytes)
            .map_err(crate::digest::Error::from)?
        {
            return Err(Error::InvalidArgument(
                "unpacked tar digest does not match annotation".to_string(),
            ));
        }
        std::fs::create_dir_all(dest)?;
        let mut archive = tar::Archive::new(Cursor::new(&tar_bytes));
        archive.unpack(dest)?;
        Ok(())
    }
}

impl Existable for FileStore {
    async fn exists(&self, descriptor: &BasicDescriptor) -> Result<bool, Error> {
        self.check_open()?;
        Ok(self.read_fallback(&descriptor.digest)?.is_some())
    }
}

impl Fetchable for FileStore {
    async fn fetch(&self, descriptor: &BasicDescriptor) -> Result<Blob, Error> {
        self.check_open()?;
        let data = self.read_fallback(&descriptor.digest)?.ok_or(Error::NotFound)?;
        Ok(Blob {
            descriptor: Descriptor {
                media_type: descriptor.media_type.clone(),
                digest: descriptor.digest.clone(),
                size: data.len() as i64,
                annotations: Default::default(),
                artifact_type: None,
                subject: None,
            },
            data: Bytes::from(data),
        })
    }
}

impl Pushable for FileStore {
    async fn push(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), Error> {
        self.check_open()?;

        let is_unpack = descriptor
            .annotations
            .get(UNPACK_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false);

        // force_cas=false restores a sibling named copy from the fallback area instead of
        // re-verifying and rewriting bytes already known (by digest) to be on disk.
        if !self.options.force_cas && !is_unpack {
            if let Some(name) = self.named_path(descriptor) {
                let path = self.resolve_named(name)?;
                if !path.exists() {
                    if let Some(existing) = self.read_fallback(&descriptor.digest)? {
                        info!("restoring sibling named copy of {} at {name}", descriptor.digest);
                        self.write_named(&path, &existing, &descriptor.digest)?;
                        return Ok(());
                    }
                }
            }
        } else if self.options.force_cas {
            trace!("force_cas set, skipping sibling named-copy restore for {}", descriptor.digest);
        }

        let reader = crate::stream::ExactReader::new(
            std::io::Cursor::new(data.to_vec()),
            descriptor.size,
            descriptor.digest.clone(),
        );
        let verified = reader.read_to_end().await?;

        match self.named_path(descriptor) {
            Some(name) if is_unpack && !self.options.skip_unpack => {
                let path = self.resolve_named(name)?;
                let inner = descriptor
                    .annotations
                    .get(UNPACKED_DIGEST_ANNOTATION)
                    .and_then(|s| s.parse::<Digest>().ok())
                    .ok_or_else(|| Error::InvalidArgument("missing unpack digest annotation".to_string()))?;
                self.unpack_directory(&path, &verified, &inner)?;
            }
            Some(name) => {
                let path = self.resolve_named(name)?;
                self.write_named(&path, &verified, &descriptor.digest)?;
            }
            None if self.options.ignore_no_name => {
                // graph-only: fall through without touching disk
            }
            None => {
                self.write_fallback(&descriptor.digest, &verified).await?;
            }
        }

        if self.named_path(descriptor).is_some() {
            // also keep a fallback copy so exists()/fetch() by digest work for named pushes
            let _ = self.write_fallback(&descriptor.digest, &verified).await;
        }

        let successors = graph::parse_successors(&descriptor.media_type, &verified)
            .map_err(|_| Error::InvalidArgument("unparseable manifest body".to_string()))?;
        if !successors.is_empty() {
            let mut preds = self.predecessors.write().await;
            for child in &successors {
                preds.entry(child.basic()).or_default().push(descriptor.clone());
            }
        }

        Ok(())
    }
}

impl Resolvable for FileStore {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        self.check_open()?;
        self.tags
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

impl Taggable for FileStore {
    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), Error> {
        self.check_open()?;
        if reference.is_empty() {
            return Err(Error::InvalidArgument("empty tag".to_string()));
        }
        if self.read_fallback(&descriptor.digest)?.is_none() {
            return Err(Error::NotFound);
        }
        self.tags.write().await.insert(reference.to_string(), descriptor.clone());
        Ok(())
    }
}

impl Deletable for FileStore {
    async fn delete(&self, descriptor: &BasicDescriptor) -> Result<(), Error> {
        self.check_open()?;
        let key = Self::blob_key(&descriptor.digest);
        match rustix::fs::unlinkat(&self.dirs.blobs, &key, rustix::fs::AtFlags::empty()) {
            Ok(()) => Ok(()),
            Err(rustix::io::Errno::NOENT) => Err(Error::NotFound),
            Err(e) => {
                error!("delete failed for {}: {:?}", descriptor.digest, e);
                Err(e.into())
            }
        }
    }
}

impl PredecessorFindable for FileStore {
    async fn predecessors(&self, descriptor: &BasicDescriptor) -> Result<Vec<Descriptor>, Error> {
        self.check_open()?;
        Ok(self
            .predecessors
            .read()
            .await
            .get(descriptor)
            .cloned()
            .unwrap_or_default())
    }
}

fn open_or_create_subdir(dir: &OwnedFd, name: &str) -> Result<OwnedFd, Error> {
    match rustix::fs::mkdirat(dir, name, Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(rustix::io::Errno::EXIST) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(rustix::fs::openat2(
        dir,
        name,
        OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
        ResolveFlags::BENEATH,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(media_type: &str, data: &[u8]) -> Descriptor {
        Descriptor::new(media_type, Digest::sha256(data), data.len() as i64).unwrap()
    }

    #[tokio::test]
    async fn push_then_fetch_fallback_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path(), Options::default()).unwrap();
        let data = b"blob content".to_vec();
        let d = descriptor("application/vnd.oci.image.layer.v1.tar", &data);
        store.push(&d, Bytes::from(data.clone())).await.unwrap();
        assert!(store.exists(&d.basic()).await.unwrap());
        let fetched = store.fetch(&d.basic()).await.unwrap();
        assert_eq!(fetched.data.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn push_named_writes_to_title_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path(), Options::default()).unwrap();
        let data = b"named content".to_vec();
        let mut d = descriptor("application/octet-stream", &data);
        d.annotations.insert(TITLE_ANNOTATION.to_string(), "hello.txt".to_string());
        store.push(&d, Bytes::from(data.clone())).await.unwrap();
        let on_disk = std::fs::read(tmp.path().join("hello.txt")).unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn push_rejects_path_traversal_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path(), Options::default()).unwrap();
        let data = b"x".to_vec();
        let mut d = descriptor("application/octet-stream", &data);
        d.annotations.insert(TITLE_ANNOTATION.to_string(), "../escape.txt".to_string());
        let err = store.push(&d, Bytes::from(data)).await.unwrap_err();
        assert!(matches!(err, Error::PathTraversalDisallowed(_)));
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path(), Options::default()).unwrap();
        store.close();
        let d = descriptor("application/octet-stream", b"x");
        let err = store.exists(&d.basic()).await.unwrap_err();
        assert!(matches!(err, Error::StoreClosed));
    }

    #[tokio::test]
    async fn disable_overwrite_rejects_second_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(
            tmp.path(),
            Options {
                disable_overwrite: true,
                ..Options::default()
            },
        )
        .unwrap();
        let data1 = b"version one".to_vec();
        let mut d1 = descriptor("application/octet-stream", &data1);
        d1.annotations.insert(TITLE_ANNOTATION.to_string(), "f.txt".to_string());
        store.push(&d1, Bytes::from(data1)).await.unwrap();

        let data2 = b"version two!".to_vec();
        let mut d2 = descriptor("application/octet-stream", &data2);
        d2.annotations.insert(TITLE_ANNOTATION.to_string(), "f.txt".to_string());
        let err = store.push(&d2, Bytes::from(data2)).await.unwrap_err();
        assert!(matches!(err, Error::OverwriteDisallowed));
    }

    #[tokio::test]
    async fn force_cas_false_restores_sibling_named_copy_from_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path(), Options::default()).unwrap();
        let data = b"shared content".to_vec();
        let mut d1 = descriptor("application/octet-stream", &data);
        d1.annotations.insert(TITLE_ANNOTATION.to_string(), "a.txt".to_string());
        store.push(&d1, Bytes::from(data.clone())).await.unwrap();

        let mut d2 = descriptor("application/octet-stream", &data);
        d2.annotations.insert(TITLE_ANNOTATION.to_string(), "b.txt".to_string());
        // empty body: the restore fast path must not need real bytes to succeed
        store.push(&d2, Bytes::new()).await.unwrap();

        let on_disk = std::fs::read(tmp.path().join("b.txt")).unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn force_cas_true_requires_real_bytes_even_for_sibling_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(
            tmp.path(),
            Options {
                force_cas: true,
                ..Options::default()
            },
        )
        .unwrap();
        let data = b"shared content".to_vec();
        let mut d1 = descriptor("application/octet-stream", &data);
        d1.annotations.insert(TITLE_ANNOTATION.to_string(), "a.txt".to_string());
        store.push(&d1, Bytes::from(data.clone())).await.unwrap();

        let mut d2 = descriptor("application/octet-stream", &data);
        d2.annotations.insert(TITLE_ANNOTATION.to_string(), "b.txt".to_string());
        let err = store.push(&d2, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }

    #[tokio::test]
    async fn different_content_under_same_name_is_a_duplicate_name_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path(), Options::default()).unwrap();
        let data1 = b"version one".to_vec();
        let mut d1 = descriptor("application/octet-stream", &data1);
        d1.annotations.insert(TITLE_ANNOTATION.to_string(), "f.txt".to_string());
        store.push(&d1, Bytes::from(data1)).await.unwrap();

        let data2 = b"version two!".to_vec();
        let mut d2 = descriptor("application/octet-stream", &data2);
        d2.annotations.insert(TITLE_ANNOTATION.to_string(), "f.txt".to_string());
        let err = store.push(&d2, Bytes::from(data2)).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
    }

    #[tokio::test]
    async fn fallback_limit_rejects_oversized_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(
            tmp.path(),
            Options {
                fallback_limit: 4,
                ..Options::default()
            },
        )
        .unwrap();
        let data = b"too big".to_vec();
        let d = descriptor("application/octet-stream", &data);
        let err = store.push(&d, Bytes::from(data)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
