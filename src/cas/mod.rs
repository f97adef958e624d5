pub mod file;
pub mod memory;

use bytes::Bytes;

use crate::digest::{BasicDescriptor, Descriptor};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotFound,
    AlreadyExists,
    OverwriteDisallowed,
    DuplicateName(String),
    PathTraversalDisallowed(String),
    StoreClosed,
    InvalidArgument(String),
    Digest(#[from] crate::digest::Error),
    Stream(#[from] crate::stream::Error),
    Io(#[from] std::io::Error),
    Errno(#[from] rustix::io::Errno),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// moka's try_get_with shares one Arc<Error> across racing waiters; the copy engine's
// proxy cache needs its own owned Error out of that Arc, so io::Error (not Clone) gets
// collapsed to its message the same way the rest of this enum already does at its edges.
impl Clone for Error {
    fn clone(&self) -> Self {
        use Error::*;
        match self {
            NotFound => NotFound,
            AlreadyExists => AlreadyExists,
            OverwriteDisallowed => OverwriteDisallowed,
            DuplicateName(s) => DuplicateName(s.clone()),
            PathTraversalDisallowed(s) => PathTraversalDisallowed(s.clone()),
            StoreClosed => StoreClosed,
            InvalidArgument(s) => InvalidArgument(s.clone()),
            Digest(e) => Digest(e.clone()),
            Stream(e) => Stream(e.clone()),
            Io(e) => InvalidArgument(e.to_string()),
            Errno(e) => Errno(*e),
        }
    }
}

/// Byte content paired with its descriptor, returned by a fetch.
pub struct Blob {
    pub descriptor: Descriptor,
    pub data: Bytes,
}

pub trait Existable {
    fn exists(
        &self,
        descriptor: &BasicDescriptor,
    ) -> impl Future<Output = Result<bool, Error>> + Send;
}

pub trait Fetchable {
    fn fetch(
        &self,
        descriptor: &BasicDescriptor,
    ) -> impl Future<Output = Result<Blob, Error>> + Send;
}

pub trait Pushable {
    fn push(
        &self,
        descriptor: &Descriptor,
        data: Bytes,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Same as `push`, but lets a remote destination attempt a same-registry blob mount
    /// instead of uploading bytes it already has elsewhere. Stores with no such shortcut
    /// (the in-memory and file CAS) fall back to a plain push.
    fn push_with_mount(
        &self,
        descriptor: &Descriptor,
        data: Bytes,
        _mount_from_repository: Option<&str>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        self.push(descriptor, data)
    }
}

pub trait Resolvable {
    fn resolve(
        &self,
        reference: &str,
    ) -> impl Future<Output = Result<Descriptor, Error>> + Send;
}

pub trait Taggable {
    fn tag(
        &self,
        descriptor: &Descriptor,
        reference: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

pub trait Deletable {
    fn delete(
        &self,
        descriptor: &BasicDescriptor,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

pub trait PredecessorFindable {
    fn predecessors(
        &self,
        descriptor: &BasicDescriptor,
    ) -> impl Future<Output = Result<Vec<Descriptor>, Error>> + Send;
}
