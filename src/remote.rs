use bytes::Bytes;
use log::{trace, warn};
use reqwest::{Method, Request, StatusCode, header};

use crate::auth::{AuthClient, Scope};
use crate::digest::{BasicDescriptor, Descriptor, Digest};
use crate::reference::Reference;
use crate::url;

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const DEFAULT_MAX_METADATA_BYTES: u64 = 4 * 1024 * 1024;
const RANGE_CHUNK: u64 = 1024 * 1024;

const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

fn default_manifest_accept() -> Vec<&'static str> {
    vec![DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_MANIFEST, OCI_INDEX]
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Auth(#[from] crate::auth::Error),
    Digest(#[from] crate::digest::Error),
    Reqwest(#[from] reqwest::Error),
    Io(#[from] std::io::Error),
    NotFound,
    SizeLimitExceeded,
    MismatchedSize,
    MismatchedDigest,
    MissingLocation,
    UnknownContentLength,
    BadContentType(String),
    RangeFailure,
    ResponseError { method: String, url: String, status: u16 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub struct RepositoryOptions {
    pub plain_http: bool,
    pub manifest_accept: Vec<&'static str>,
    pub tag_page_size: Option<u32>,
    pub max_metadata_bytes: u64,
    pub user_agent: String,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        RepositoryOptions {
            plain_http: false,
            manifest_accept: default_manifest_accept(),
            tag_page_size: None,
            max_metadata_bytes: DEFAULT_MAX_METADATA_BYTES,
            user_agent: "orca-dist".to_string(),
        }
    }
}

/// A single repository on a remote registry, bound to transport + negotiation config.
/// Blob and manifest operations share the same auth client and authority.
#[derive(Clone)]
pub struct RemoteRepository {
    auth: AuthClient,
    reference: Reference,
    options: std::sync::Arc<RepositoryOptions>,
}

impl RemoteRepository {
    pub fn new(auth: AuthClient, reference: Reference, options: RepositoryOptions) -> Self {
        RemoteRepository {
            auth,
            reference,
            options: options.into(),
        }
    }

    fn authority(&self) -> &str {
        self.reference.host()
    }

    pub fn repository(&self) -> &str {
        self.reference.repository()
    }

    fn pull_scope(&self) -> Scope {
        Scope::new("repository", self.repository(), &["pull"])
    }

    fn push_scope(&self) -> Scope {
        Scope::new("repository", self.repository(), &["pull", "push"])
    }

    async fn send(&self, scope: Scope, request: Request) -> Result<reqwest::Response, Error> {
        Ok(self.auth.send(self.authority(), Some(&scope), request).await?)
    }

    // blobs

    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool, Error> {
        let url = url::blob(self.authority(), self.options.plain_http, self.repository(), &digest.to_string());
        trace!("HEAD {url}");
        let request = self.auth.http().request(Method::HEAD, &url).build()?;
        let response = self.send(self.pull_scope(), request).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(response_error("HEAD", &url, status)),
        }
    }

    pub async fn blob_fetch(&self, descriptor: &BasicDescriptor) -> Result<Bytes, Error> {
        let url = url::blob(
            self.authority(),
            self.options.plain_http,
            self.repository(),
            &descriptor.digest.to_string(),
        );
        trace!("GET {url}");
        let request = self.auth.http().request(Method::GET, &url).build()?;
        let response = self.send(self.pull_scope(), request).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound),
            status => return Err(response_error("GET", &url, status)),
        }
        let accepts_ranges = response
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "bytes")
            .unwrap_or(false);
        let content_length = response.content_length();
        if let Some(total) = content_length {
            if accepts_ranges {
                trace!("blob {url} content-length={total} accept-ranges=bytes, reading via ranged GETs");
                return self.blob_fetch_ranged(descriptor, total).await;
            }
        }
        let data = response.bytes().await?;
        if let Some(len) = content_length {
            if data.len() as u64 != len {
                return Err(Error::MismatchedSize);
            }
        }
        Ok(data)
    }

    /// Ranged read path, used when the first response advertised `Accept-Ranges: bytes`
    /// and the caller wants to avoid holding one huge in-flight response.
    pub async fn blob_fetch_ranged(&self, descriptor: &BasicDescriptor, total_size: u64) -> Result<Bytes, Error> {
        let url = url::blob(
            self.authority(),
            self.options.plain_http,
            self.repository(),
            &descriptor.digest.to_string(),
        );
        let mut out = Vec::with_capacity(total_size as usize);
        let mut offset = 0u64;
        while offset < total_size {
            let end = (offset + RANGE_CHUNK - 1).min(total_size - 1);
            let range = format!("bytes={offset}-{end}");
            trace!("GET {url} Range={range}");
            let request = self
                .auth
                .http()
                .request(Method::GET, &url)
                .header(header::RANGE, &range)
                .build()?;
            let response = self.send(self.pull_scope(), request).await?;
            if response.status() != StatusCode::PARTIAL_CONTENT {
                return Err(Error::RangeFailure);
            }
            let chunk = response.bytes().await?;
            out.extend_from_slice(&chunk);
            offset = end + 1;
        }
        Ok(Bytes::from(out))
    }

    pub async fn blob_resolve(&self, reference_digest: &Digest) -> Result<Descriptor, Error> {
        let url = url::blob(
            self.authority(),
            self.options.plain_http,
            self.repository(),
            &reference_digest.to_string(),
        );
        trace!("HEAD {url}");
        let request = self.auth.http().request(Method::HEAD, &url).build()?;
        let response = self.send(self.pull_scope(), request).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound),
            status => return Err(response_error("HEAD", &url, status)),
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let size = response.content_length().ok_or(Error::UnknownContentLength)?;
        let digest = docker_content_digest(&response)?.unwrap_or_else(|| reference_digest.clone());
        Ok(Descriptor::new(content_type, digest, size as i64)?)
    }

    /// Two-step monolithic upload: POST to start the session, then PUT the content with
    /// `?digest=` at the returned Location. A mount hint short-circuits the PUT on 201.
    pub async fn blob_push(
        &self,
        expected: &Descriptor,
        data: Bytes,
        mount_from_repository: Option<&str>,
    ) -> Result<(), Error> {
        if let Some(from_repo) = mount_from_repository {
            let url = url::blob_upload_init_with_mount(
                self.authority(),
                self.options.plain_http,
                self.repository(),
                &expected.digest.to_string(),
                from_repo,
            );
            trace!("POST {url} (mount)");
            let request = self.auth.http().request(Method::POST, &url).build()?;
            let response = self.send(self.push_scope(), request).await?;
            if response.status() == StatusCode::CREATED {
                return Ok(());
            }
            // fall through to the normal two-step path if the mount was declined
        }

        let init_url = url::blob_upload_init(self.authority(), self.options.plain_http, self.repository());
        trace!("POST {init_url}");
        let request = self.auth.http().request(Method::POST, &init_url).build()?;
        let response = self.send(self.push_scope(), request).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(response_error("POST", &init_url, response.status()));
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingLocation)?
            .to_string();
        let location = if location.starts_with("http") {
            location
        } else {
            format!(
                "{}://{}{}",
                if self.options.plain_http { "http" } else { "https" },
                self.authority(),
                location
            )
        };
        let separator = if location.contains('?') { "&" } else { "?" };
        let put_url = format!("{location}{separator}digest={}", expected.digest);
        trace!("PUT {put_url}");
        let request = self
            .auth
            .http()
            .request(Method::PUT, &put_url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .build()?;
        let response = self.send(self.push_scope(), request).await?;
        if response.status() != StatusCode::CREATED {
            return Err(response_error("PUT", &put_url, response.status()));
        }
        Ok(())
    }

    pub async fn blob_delete(&self, descriptor: &BasicDescriptor) -> Result<(), Error> {
        let url = url::blob(
            self.authority(),
            self.options.plain_http,
            self.repository(),
            &descriptor.digest.to_string(),
        );
        trace!("DELETE {url}");
        let request = self.auth.http().request(Method::DELETE, &url).build()?;
        let response = self.send(self.push_scope(), request).await?;
        match response.status() {
            StatusCode::ACCEPTED => {
                if let Some(got) = docker_content_digest(&response)? {
                    if got != descriptor.digest {
                        return Err(Error::MismatchedDigest);
                    }
                }
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            status => Err(response_error("DELETE", &url, status)),
        }
    }

    // manifests

    pub async fn manifest_fetch(&self, reference: &str) -> Result<(Descriptor, Bytes), Error> {
        let url = url::manifest(self.authority(), self.options.plain_http, self.repository(), reference);
        trace!("GET {url}");
        let accept = self.options.manifest_accept.join(", ");
        let request = self
            .auth
            .http()
            .request(Method::GET, &url)
            .header(header::ACCEPT, accept)
            .build()?;
        let response = self.send(self.pull_scope(), request).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound),
            status => return Err(response_error("GET", &url, status)),
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !self.options.manifest_accept.contains(&content_type.as_str()) {
            return Err(Error::BadContentType(content_type));
        }
        let digest_header = docker_content_digest(&response)?;

        let data = limited_bytes(response, self.options.max_metadata_bytes).await?;

        let digest = if let Ok(d) = reference.parse::<Digest>() {
            if !d.matches(&data)? {
                return Err(Error::MismatchedDigest);
            }
            d
        } else if let Some(header_digest) = digest_header {
            header_digest
        } else {
            Digest::sha256(&data)
        };

        Ok((Descriptor::new(content_type, digest, data.len() as i64)?, data))
    }

    pub async fn manifest_push(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), Error> {
        let url = url::manifest(
            self.authority(),
            self.options.plain_http,
            self.repository(),
            &descriptor.digest.to_string(),
        );
        trace!("PUT {url}");
        let request = self
            .auth
            .http()
            .request(Method::PUT, &url)
            .header(header::CONTENT_TYPE, descriptor.media_type.clone())
            .body(data)
            .build()?;
        let response = self.send(self.push_scope(), request).await?;
        if response.status() != StatusCode::CREATED {
            return Err(response_error("PUT", &url, response.status()));
        }
        if let Some(got) = docker_content_digest(&response)? {
            if got != descriptor.digest {
                return Err(Error::MismatchedDigest);
            }
        }
        Ok(())
    }

    pub async fn manifest_tag(&self, descriptor: &Descriptor, tag: &str, data: Bytes) -> Result<(), Error> {
        let url = url::manifest(self.authority(), self.options.plain_http, self.repository(), tag);
        trace!("PUT {url} (tag)");
        let request = self
            .auth
            .http()
            .request(Method::PUT, &url)
            .header(header::CONTENT_TYPE, descriptor.media_type.clone())
            .body(data)
            .build()?;
        let response = self.send(self.push_scope(), request).await?;
        if response.status() != StatusCode::CREATED {
            return Err(response_error("PUT", &url, response.status()));
        }
        Ok(())
    }

    pub async fn manifest_delete(&self, descriptor: &BasicDescriptor) -> Result<(), Error> {
        let url = url::manifest(
            self.authority(),
            self.options.plain_http,
            self.repository(),
            &descriptor.digest.to_string(),
        );
        trace!("DELETE {url}");
        let request = self.auth.http().request(Method::DELETE, &url).build()?;
        let response = self.send(self.push_scope(), request).await?;
        match response.status() {
            StatusCode::ACCEPTED => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            status => Err(response_error("DELETE", &url, status)),
        }
    }

    /// Invokes `page` with each batch of tag names until the server stops sending a
    /// `Link` header.
    pub async fn tags_list(&self, mut page: impl FnMut(Vec<String>)) -> Result<(), Error> {
        #[derive(serde::Deserialize)]
        struct TagsResponse {
            tags: Vec<String>,
        }
        let mut next = {
            let mut u = url::tags_list(self.authority(), self.options.plain_http, self.repository());
            if let Some(n) = self.options.tag_page_size {
                u = format!("{u}?n={n}");
            }
            u.parse().map_err(|_| Error::MissingLocation)?
        };
        loop {
            trace!("GET {next}");
            let request = self.auth.http().request(Method::GET, next).build()?;
            let response = self.send(self.pull_scope(), request).await?;
            if response.status() != StatusCode::OK {
                return Err(response_error("GET", response.url().as_str(), response.status()));
            }
            let link = response
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let request_url = response.url().clone();
            let body: TagsResponse = response.json().await?;
            page(body.tags);
            match url::next_page(link.as_deref(), &request_url).map_err(|_| Error::MissingLocation)? {
                Some(n) => next = n,
                None => break,
            }
        }
        Ok(())
    }
}

fn response_error(method: &str, url: &str, status: StatusCode) -> Error {
    warn!("{method} {url} -> {status}");
    Error::ResponseError {
        method: method.to_string(),
        url: url.to_string(),
        status: status.as_u16(),
    }
}

async fn limited_bytes(response: reqwest::Response, limit: u64) -> Result<Bytes, Error> {
    if let Some(len) = response.content_length() {
        if len > limit {
            return Err(Error::SizeLimitExceeded);
        }
    }
    let data = response.bytes().await?;
    if data.len() as u64 > limit {
        return Err(Error::SizeLimitExceeded);
    }
    Ok(data)
}

fn docker_content_digest(response: &reqwest::Response) -> Result<Option<Digest>, Error> {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|v| -> Result<Digest, Error> {
            v.to_str()
                .map_err(|_| Error::BadContentType("docker-content-digest".to_string()))?
                .parse()
                .map_err(|_| Error::BadContentType("docker-content-digest".to_string()))
        })
        .transpose()
}

fn is_manifest_media_type(media_type: &str) -> bool {
    matches!(media_type, DOCKER_MANIFEST | DOCKER_MANIFEST_LIST | OCI_MANIFEST | OCI_INDEX)
}

impl From<Error> for crate::cas::Error {
    fn from(e: Error) -> crate::cas::Error {
        match e {
            Error::NotFound => crate::cas::Error::NotFound,
            Error::MismatchedDigest => crate::cas::Error::Stream(crate::stream::Error::MismatchedDigest),
            Error::MismatchedSize => {
                crate::cas::Error::Stream(crate::stream::Error::MismatchedSize { expected: 0, larger: false })
            }
            Error::SizeLimitExceeded => crate::cas::Error::Stream(crate::stream::Error::SizeLimitExceeded),
            other => crate::cas::Error::InvalidArgument(other.to_string()),
        }
    }
}

impl crate::cas::Existable for RemoteRepository {
    async fn exists(&self, descriptor: &BasicDescriptor) -> Result<bool, crate::cas::Error> {
        if is_manifest_media_type(&descriptor.media_type) {
            match self.manifest_fetch(&descriptor.digest.to_string()).await {
                Ok(_) => Ok(true),
                Err(Error::NotFound) => Ok(false),
                Err(e) => Err(e.into()),
            }
        } else {
            Ok(self.blob_exists(&descriptor.digest).await?)
        }
    }
}

impl crate::cas::Fetchable for RemoteRepository {
    async fn fetch(&self, descriptor: &BasicDescriptor) -> Result<crate::cas::Blob, crate::cas::Error> {
        if is_manifest_media_type(&descriptor.media_type) {
            let (d, data) = self.manifest_fetch(&descriptor.digest.to_string()).await?;
            Ok(crate::cas::Blob { descriptor: d, data })
        } else {
            let data = self.blob_fetch(descriptor).await?;
            let d = Descriptor::new(descriptor.media_type.clone(), descriptor.digest.clone(), data.len() as i64)?;
            Ok(crate::cas::Blob { descriptor: d, data })
        }
    }
}

impl crate::cas::Pushable for RemoteRepository {
    async fn push(&self, descriptor: &Descriptor, data: Bytes) -> Result<(), crate::cas::Error> {
        if is_manifest_media_type(&descriptor.media_type) {
            self.manifest_push(descriptor, data).await?;
        } else {
            self.blob_push(descriptor, data, None).await?;
        }
        Ok(())
    }

    async fn push_with_mount(
        &self,
        descriptor: &Descriptor,
        data: Bytes,
        mount_from_repository: Option<&str>,
    ) -> Result<(), crate::cas::Error> {
        if is_manifest_media_type(&descriptor.media_type) {
            self.manifest_push(descriptor, data).await?;
        } else {
            self.blob_push(descriptor, data, mount_from_repository).await?;
        }
        Ok(())
    }
}

impl crate::cas::Deletable for RemoteRepository {
    async fn delete(&self, descriptor: &BasicDescriptor) -> Result<(), crate::cas::Error> {
        if is_manifest_media_type(&descriptor.media_type) {
            self.manifest_delete(descriptor).await?;
        } else {
            self.blob_delete(descriptor).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_media_types_are_recognized() {
        assert!(is_manifest_media_type(OCI_MANIFEST));
        assert!(is_manifest_media_type(DOCKER_MANIFEST_LIST));
        assert!(!is_manifest_media_type("application/vnd.oci.image.layer.v1.tar"));
    }

    #[test]
    fn repository_binds_host_and_path() {
        let _ = env_logger::try_init();
        let auth = AuthClient::new("orca-dist/test").unwrap();
        let reference = Reference::parse("registry.example.com/library/alpine:3").unwrap();
        let repo = RemoteRepository::new(auth, reference, RepositoryOptions::default());
        assert_eq!(repo.authority(), "registry.example.com");
        assert_eq!(repo.repository(), "library/alpine");
    }

    #[test]
    fn default_options_cap_metadata_at_4mib() {
        let opts = RepositoryOptions::default();
        assert_eq!(opts.max_metadata_bytes, 4 * 1024 * 1024);
        assert!(opts.manifest_accept.contains(&OCI_MANIFEST));
    }
}
