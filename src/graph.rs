use oci_spec::image::{ImageIndex, ImageManifest};

use crate::cas::{Blob, Fetchable};
use crate::digest::Descriptor;

const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    OciSpec(#[from] oci_spec::OciSpecError),
    Digest(#[from] crate::digest::Error),
    Cas(#[from] crate::cas::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Children of `descriptor` by media type: manifest -> [subject?, config, layers...],
/// index -> [subject?, manifests...], anything else -> [].
pub async fn successors<S: Fetchable + Sync>(
    store: &S,
    descriptor: &Descriptor,
) -> Result<Vec<Descriptor>, Error> {
    match descriptor.media_type.as_str() {
        DOCKER_MANIFEST | OCI_MANIFEST | DOCKER_MANIFEST_LIST | OCI_INDEX => {
            let Blob { data, .. } = store.fetch(&descriptor.basic()).await?;
            parse_successors(&descriptor.media_type, &data)
        }
        _ => Ok(Vec::new()),
    }
}

/// Pure variant used right after a push, when the bytes are already in hand and a
/// round-trip fetch would be wasted work.
pub fn parse_successors(media_type: &str, data: &[u8]) -> Result<Vec<Descriptor>, Error> {
    use std::io::Cursor;
    match media_type {
        DOCKER_MANIFEST | OCI_MANIFEST => {
            let manifest = ImageManifest::from_reader(Cursor::new(data))?;
            let mut out = Vec::with_capacity(manifest.layers().len() + 2);
            if let Some(subject) = manifest.subject() {
                out.push(subject.try_into()?);
            }
            out.push(manifest.config().try_into()?);
            for layer in manifest.layers() {
                out.push(layer.try_into()?);
            }
            Ok(out)
        }
        DOCKER_MANIFEST_LIST | OCI_INDEX => {
            let index = ImageIndex::from_reader(Cursor::new(data))?;
            let mut out = Vec::with_capacity(index.manifests().len() + 1);
            if let Some(subject) = index.subject() {
                out.push(subject.try_into()?);
            }
            for m in index.manifests() {
                out.push(m.try_into()?);
            }
            Ok(out)
        }
        _ => Ok(Vec::new()),
    }
}
