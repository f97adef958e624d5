pub mod auth;
pub mod cas;
pub mod copy;
pub mod digest;
pub mod graph;
pub mod reference;
pub mod registry;
pub mod remote;
pub mod stream;
pub mod url;

pub use cas::{Blob, Existable, Fetchable, PredecessorFindable, Pushable, Resolvable, Taggable};
pub use copy::{copy_graph, extended_copy_graph, CopyOptions};
pub use digest::{Algorithm, BasicDescriptor, Descriptor, Digest};
pub use reference::Reference;
pub use registry::{Registry, RegistryOptions};
pub use remote::{RemoteRepository, RepositoryOptions};
