use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use log::{info, trace};
use moka::future::Cache;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::cas::{Existable, Fetchable, Pushable};
use crate::digest::{BasicDescriptor, Descriptor};
use crate::graph;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Cas(#[from] crate::cas::Error),
    Graph(#[from] crate::graph::Error),
    MaxConcurrency(#[from] tokio::sync::AcquireError),
    Join,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCopyDecision {
    Copy,
    SkipNode,
}

type PreCopyHook = Arc<dyn Fn(&Descriptor) -> PreCopyDecision + Send + Sync>;
type NodeHook = Arc<dyn Fn(&Descriptor) + Send + Sync>;
type FindSuccessorsHook = Arc<dyn Fn(&Descriptor, &Bytes) -> Result<Vec<Descriptor>, graph::Error> + Send + Sync>;

#[derive(Clone)]
pub struct CopyOptions {
    pub concurrency: usize,
    /// Caps predecessor-closure search depth in `extended_copy_graph`; 0 means unbounded.
    pub depth: u32,
    /// Set when `src`/`dst` are both remote repositories on the same registry, naming the
    /// source repository so blob pushes can attempt a mount instead of an upload.
    pub mount_from_repository: Option<String>,
    pub pre_copy: Option<PreCopyHook>,
    pub post_copy: Option<NodeHook>,
    pub on_copy_skipped: Option<NodeHook>,
    /// Overrides `graph::parse_successors` for computing a node's children, e.g. to widen
    /// or narrow traversal for a caller-specific artifact type.
    pub find_successors: Option<FindSuccessorsHook>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            concurrency: 4,
            depth: 0,
            mount_from_repository: None,
            pre_copy: None,
            post_copy: None,
            on_copy_skipped: None,
            find_successors: None,
        }
    }
}

impl std::fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CopyOptions")
            .field("concurrency", &self.concurrency)
            .field("depth", &self.depth)
            .field("mount_from_repository", &self.mount_from_repository)
            .finish_non_exhaustive()
    }
}

struct Shared<S, D> {
    src: S,
    dst: D,
    opts: CopyOptions,
    claimed: Mutex<std::collections::HashSet<BasicDescriptor>>,
    semaphore: Arc<Semaphore>,
    // proxy cache: a manifest consulted both for its successors and for its push body is
    // fetched from `src` at most once, shared across sibling recursions.
    proxy: Cache<BasicDescriptor, (Descriptor, Bytes)>,
}

impl<S, D> Shared<S, D>
where
    S: Fetchable + Sync,
{
    async fn fetch_cached(&self, basic: &BasicDescriptor) -> Result<(Descriptor, Bytes), Error> {
        let src = &self.src;
        self.proxy
            .try_get_with(basic.clone(), async move {
                let blob = src.fetch(basic).await?;
                Ok::<_, crate::cas::Error>((blob.descriptor, blob.data))
            })
            .await
            .map_err(|e| Error::Cas((*e).clone()))
    }

    fn skipped(&self, node: &Descriptor) {
        if let Some(hook) = &self.opts.on_copy_skipped {
            hook(node);
        }
    }
}

/// Concurrent DFS copy of the DAG rooted at `root` from `src` into `dst`. Every
/// successor's push to `dst` happens-before its predecessor's push, preserving referrer
/// existence for any registry that requires it. Nodes already present at `dst`, or already
/// claimed for copy by a concurrent sibling recursion, are skipped (invoking
/// `opts.on_copy_skipped`).
pub async fn copy_graph<S, D>(src: S, dst: D, root: Descriptor, opts: CopyOptions) -> Result<(), Error>
where
    S: Fetchable + Sync + Send + Clone + 'static,
    D: Existable + Pushable + Sync + Send + Clone + 'static,
{
    let concurrency = opts.concurrency.max(1);
    let shared = Arc::new(Shared {
        src,
        dst,
        opts,
        claimed: Mutex::new(std::collections::HashSet::new()),
        semaphore: Arc::new(Semaphore::new(concurrency)),
        proxy: Cache::new(10_000),
    });
    copy_node(shared, root).await
}

fn copy_node<S, D>(shared: Arc<Shared<S, D>>, node: Descriptor) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>
where
    S: Fetchable + Sync + Send + Clone + 'static,
    D: Existable + Pushable + Sync + Send + Clone + 'static,
{
    Box::pin(async move {
        let basic = node.basic();

        {
            let mut claimed = shared.claimed.lock().await;
            if !claimed.insert(basic.clone()) {
                trace!("copy skipped, already claimed: {}", basic.digest);
                shared.skipped(&node);
                return Ok(());
            }
        }

        let permit = shared.semaphore.clone().acquire_owned().await?;
        let exists = shared.dst.exists(&basic).await?;
        drop(permit);
        if exists {
            trace!("copy skipped, already present at destination: {}", basic.digest);
            shared.skipped(&node);
            return Ok(());
        }

        let (descriptor, data) = shared.fetch_cached(&basic).await?;
        let children = match &shared.opts.find_successors {
            Some(f) => f(&descriptor, &data)?,
            None => graph::parse_successors(&descriptor.media_type, &data)?,
        };

        let mut set = JoinSet::new();
        for child in children {
            let shared = shared.clone();
            set.spawn(copy_node(shared, child));
        }
        while let Some(res) = set.join_next().await {
            res.map_err(|_| Error::Join)??;
        }

        if let Some(hook) = &shared.opts.pre_copy {
            if hook(&node) == PreCopyDecision::SkipNode {
                shared.skipped(&node);
                return Ok(());
            }
        }

        let permit = shared.semaphore.clone().acquire_owned().await?;
        shared
            .dst
            .push_with_mount(&node, data, shared.opts.mount_from_repository.as_deref())
            .await?;
        drop(permit);

        if let Some(hook) = &shared.opts.post_copy {
            hook(&node);
        }
        info!("copied {} ({})", basic.digest, basic.media_type);
        Ok(())
    })
}

/// Finds the predecessor-closure roots of `node` (predecessor set empty, or `opts.depth`
/// reached) and copies each of them, sharing one claimed-set and semaphore so overlapping
/// sub-DAGs across roots are never copied twice.
pub async fn extended_copy_graph<S, D>(
    src: S,
    dst: D,
    node: Descriptor,
    opts: CopyOptions,
) -> Result<(), Error>
where
    S: Fetchable + Sync + Send + Clone + 'static + crate::cas::PredecessorFindable,
    D: Existable + Pushable + Sync + Send + Clone + 'static,
{
    let mut roots = Vec::new();
    let mut seen = std::collections::HashSet::new();
    find_roots(&src, node, 0, opts.depth, &mut roots, &mut seen).await?;

    let concurrency = opts.concurrency.max(1);
    let shared = Arc::new(Shared {
        src,
        dst,
        opts,
        claimed: Mutex::new(std::collections::HashSet::new()),
        semaphore: Arc::new(Semaphore::new(concurrency)),
        proxy: Cache::new(10_000),
    });
    for root in roots {
        copy_node(shared.clone(), root).await?;
    }
    Ok(())
}

fn find_roots<'a, S>(
    src: &'a S,
    node: Descriptor,
    depth: u32,
    max_depth: u32,
    roots: &'a mut Vec<Descriptor>,
    seen: &'a mut std::collections::HashSet<BasicDescriptor>,
) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>
where
    S: crate::cas::PredecessorFindable + Sync + Send,
{
    Box::pin(async move {
        let basic = node.basic();
        if !seen.insert(basic.clone()) {
            return Ok(());
        }
        if max_depth > 0 && depth >= max_depth {
            roots.push(node);
            return Ok(());
        }
        let preds = src.predecessors(&basic).await?;
        if preds.is_empty() {
            roots.push(node);
            return Ok(());
        }
        for pred in preds {
            find_roots(src, pred, depth + 1, max_depth, roots, seen).await?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::memory::MemoryStore;
    use crate::digest::Digest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn layer(data: &[u8]) -> Descriptor {
        Descriptor::new(
            "application/vnd.oci.image.layer.v1.tar",
            Digest::sha256(data),
            data.len() as i64,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn copies_a_single_node() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let data = b"layer bytes".to_vec();
        let d = layer(&data);
        src.push(&d, Bytes::from(data.clone())).await.unwrap();

        copy_graph(src.clone(), dst.clone(), d.clone(), CopyOptions::default())
            .await
            .unwrap();

        assert!(dst.exists(&d.basic()).await.unwrap());
        let fetched = dst.fetch(&d.basic()).await.unwrap();
        assert_eq!(fetched.data.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn skips_nodes_already_at_destination() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let data = b"already there".to_vec();
        let d = layer(&data);
        src.push(&d, Bytes::from(data.clone())).await.unwrap();
        dst.push(&d, Bytes::from(data)).await.unwrap();

        let skipped = Arc::new(AtomicUsize::new(0));
        let skipped_clone = skipped.clone();
        let opts = CopyOptions {
            on_copy_skipped: Some(Arc::new(move |_| {
                skipped_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..CopyOptions::default()
        };
        // would fail with AlreadyExists if copy_node attempted another push
        copy_graph(src, dst, d, opts).await.unwrap();
        assert_eq!(skipped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pre_copy_hook_can_skip_a_node() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let data = b"never lands".to_vec();
        let d = layer(&data);
        src.push(&d, Bytes::from(data)).await.unwrap();

        let opts = CopyOptions {
            pre_copy: Some(Arc::new(|_| PreCopyDecision::SkipNode)),
            ..CopyOptions::default()
        };
        copy_graph(src, dst.clone(), d.clone(), opts).await.unwrap();
        assert!(!dst.exists(&d.basic()).await.unwrap());
    }

    #[tokio::test]
    async fn post_copy_hook_fires_once_per_copied_node() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();
        let data = b"counted".to_vec();
        let d = layer(&data);
        src.push(&d, Bytes::from(data)).await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let opts = CopyOptions {
            post_copy: Some(Arc::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..CopyOptions::default()
        };
        copy_graph(src, dst, d, opts).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn find_successors_override_controls_traversal() {
        let src = MemoryStore::new();
        let dst = MemoryStore::new();

        let leaf_data = b"leaf, not linked by parse_successors".to_vec();
        let leaf = layer(&leaf_data);
        src.push(&leaf, Bytes::from(leaf_data)).await.unwrap();
        let leaf_basic = leaf.basic();
        let injected = leaf.clone();

        let root_data = b"root".to_vec();
        let root = layer(&root_data);
        src.push(&root, Bytes::from(root_data)).await.unwrap();

        // a layer has no successors under the real parser; the override injects one anyway
        let opts = CopyOptions {
            find_successors: Some(Arc::new(move |d, _data| {
                if d.basic() == leaf_basic {
                    Ok(Vec::new())
                } else {
                    Ok(vec![injected.clone()])
                }
            })),
            ..CopyOptions::default()
        };

        copy_graph(src, dst.clone(), root, opts).await.unwrap();
        assert!(dst.exists(&leaf_basic).await.unwrap());
    }
}
