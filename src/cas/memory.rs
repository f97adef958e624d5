use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use super::{Blob, Deletable, Error, Existable, Fetchable, PredecessorFindable, Pushable, Resolvable, Taggable};
use crate::digest::{BasicDescriptor, Descriptor};
use crate::graph;

#[derive(Default)]
struct Inner {
    blobs: HashMap<BasicDescriptor, Bytes>,
    tags: HashMap<String, Descriptor>,
    predecessors: HashMap<BasicDescriptor, Vec<Descriptor>>,
}

/// Concurrent map-backed CAS: blob storage, tag index, and predecessor graph, each guarded
/// by its own lock so pushes of unrelated descriptors don't serialize against each other
/// more than necessary.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Existable for MemoryStore {
    async fn exists(&self, descriptor: &BasicDescriptor) -> Result<bool, Error> {
        Ok(self.inner.read().await.blobs.contains_key(descriptor))
    }
}

impl Fetchable for MemoryStore {
    async fn fetch(&self, descriptor: &BasicDescriptor) -> Result<Blob, Error> {
        let inner = self.inner.read().await;
        let data = inner.blobs.get(descriptor).ok_or(Error::NotFound)?.clone();
        Ok(Blob {
            descriptor: Descriptor {
                media_type: descriptor.media_type.clone(),
                digest: descriptor.digest.clone(),
                size: data.len() as i64,
                annotations: Default::default(),
                artifact_type: None,
                subject: None,
            },
            data,
        })
    }
}

impl Pushable for MemoryStore {
    async fn push(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), Error> {
        let reader = crate::stream::ExactReader::new(
            std::io::Cursor::new(data.to_vec()),
            descriptor.size,
            descriptor.digest.clone(),
        );
        let verified = reader.read_to_end().await?;

        let basic = descriptor.basic();
        let successors = graph::parse_successors(&descriptor.media_type, &verified)
            .map_err(|_| Error::InvalidArgument("unparseable manifest body".to_string()))?;

        let mut inner = self.inner.write().await;
        if inner.blobs.contains_key(&basic) {
            return Err(Error::AlreadyExists);
        }
        inner.blobs.insert(basic.clone(), Bytes::from(verified));
        for child in &successors {
            inner
                .predecessors
                .entry(child.basic())
                .or_default()
                .push(descriptor.clone());
        }
        Ok(())
    }
}

impl Resolvable for MemoryStore {
    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        self.inner
            .read()
            .await
            .tags
            .get(reference)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

impl Taggable for MemoryStore {
    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), Error> {
        if reference.is_empty() {
            return Err(Error::InvalidArgument("empty tag".to_string()));
        }
        let mut inner = self.inner.write().await;
        if !inner.blobs.contains_key(&descriptor.basic()) {
            return Err(Error::NotFound);
        }
        inner.tags.insert(reference.to_string(), descriptor.clone());
        Ok(())
    }
}

impl Deletable for MemoryStore {
    async fn delete(&self, descriptor: &BasicDescriptor) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        if inner.blobs.remove(descriptor).is_none() {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}

impl PredecessorFindable for MemoryStore {
    async fn predecessors(&self, descriptor: &BasicDescriptor) -> Result<Vec<Descriptor>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .predecessors
            .get(descriptor)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn descriptor(media_type: &str, data: &[u8]) -> Descriptor {
        Descriptor::new(media_type, Digest::sha256(data), data.len() as i64).unwrap()
    }

    #[tokio::test]
    async fn push_then_fetch_round_trips() {
        let store = MemoryStore::new();
        let data = b"layer bytes".to_vec();
        let d = descriptor("application/vnd.oci.image.layer.v1.tar", &data);
        store.push(&d, Bytes::from(data.clone())).await.unwrap();
        assert!(store.exists(&d.basic()).await.unwrap());
        let fetched = store.fetch(&d.basic()).await.unwrap();
        assert_eq!(fetched.data.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn second_push_of_same_key_fails() {
        let store = MemoryStore::new();
        let data = b"same bytes".to_vec();
        let d = descriptor("application/vnd.oci.image.layer.v1.tar", &data);
        store.push(&d, Bytes::from(data.clone())).await.unwrap();
        let err = store.push(&d, Bytes::from(data)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[tokio::test]
    async fn push_rejects_digest_mismatch_and_leaves_no_trace() {
        let store = MemoryStore::new();
        let data = b"real content".to_vec();
        let mut d = descriptor("application/vnd.oci.image.layer.v1.tar", &data);
        d.digest = Digest::sha256("different content");
        let err = store.push(&d, Bytes::from(data)).await;
        assert!(err.is_err());
        assert!(!store.exists(&d.basic()).await.unwrap());
    }

    #[tokio::test]
    async fn tag_requires_existing_descriptor() {
        let store = MemoryStore::new();
        let d = descriptor("application/vnd.oci.image.layer.v1.tar", b"x");
        let err = store.tag(&d, "latest").await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn resolve_after_tag() {
        let store = MemoryStore::new();
        let data = b"tagged content".to_vec();
        let d = descriptor("application/vnd.oci.image.layer.v1.tar", &data);
        store.push(&d, Bytes::from(data)).await.unwrap();
        store.tag(&d, "v1").await.unwrap();
        let resolved = store.resolve("v1").await.unwrap();
        assert_eq!(resolved, d);
    }
}
