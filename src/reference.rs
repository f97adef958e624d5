use crate::digest::Digest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    InvalidReference(String),
    InvalidRegistry(String),
    InvalidRepository(String),
    InvalidTag(String),
    InvalidDigest(String),
    NoDigest,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Empty,
    Tag(String),
    Digest(String),
}

/// `registry[:port]/repository[:tag][@digest]`, one of Forms A-D:
/// A = reg/repo@digest, B = reg/repo:tag@digest (tag dropped), C = reg/repo:tag, D = reg/repo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    reference: Kind,
}

impl Reference {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let (registry, rest) = input
            .split_once('/')
            .ok_or_else(|| Error::InvalidReference(input.to_string()))?;
        validate_registry(registry)?;

        let (repo_and_tag, reference) = match rest.split_once('@') {
            Some((before, digest)) => {
                validate_digest(digest)?;
                let repo = before.split_once(':').map(|(r, _)| r).unwrap_or(before);
                (repo, Kind::Digest(digest.to_string()))
            }
            None => match rest.split_once(':') {
                Some((repo, tag)) => {
                    validate_tag(tag)?;
                    (repo, Kind::Tag(tag.to_string()))
                }
                None => (rest, Kind::Empty),
            },
        };

        validate_repository(repo_and_tag)?;

        Ok(Reference {
            registry: registry.to_string(),
            repository: repo_and_tag.to_string(),
            reference,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.reference {
            Kind::Tag(t) => Some(t),
            _ => None,
        }
    }

    pub fn digest(&self) -> Option<Digest> {
        match &self.reference {
            Kind::Digest(d) => d.parse().ok(),
            _ => None,
        }
    }

    /// docker.io canonicalises to the actual registry host.
    pub fn host(&self) -> &str {
        if self.registry == "docker.io" {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }

    pub fn with_digest(&self, digest: Digest) -> Self {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: Kind::Digest(digest.to_string()),
        }
    }

    pub fn require_digest(&self) -> Result<Digest, Error> {
        self.digest().ok_or(Error::NoDigest)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.reference {
            Kind::Empty => write!(f, "{}/{}", self.registry, self.repository),
            Kind::Tag(t) => write!(f, "{}/{}:{}", self.registry, self.repository, t),
            Kind::Digest(d) => write!(f, "{}/{}@{}", self.registry, self.repository, d),
        }
    }
}

impl std::str::FromStr for Reference {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        Reference::parse(s)
    }
}

fn validate_registry(registry: &str) -> Result<(), Error> {
    if registry.is_empty() {
        return Err(Error::InvalidRegistry(registry.to_string()));
    }
    if let Some(authority) = registry.strip_prefix("dummy://") {
        if authority.is_empty() {
            return Err(Error::InvalidRegistry(registry.to_string()));
        }
    }
    Ok(())
}

fn validate_repository(repo: &str) -> Result<(), Error> {
    if repo.is_empty() || repo.starts_with('/') || repo.ends_with('/') || repo.contains("//") {
        return Err(Error::InvalidRepository(repo.to_string()));
    }
    let valid = repo
        .split('/')
        .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-'));
    if !valid {
        return Err(Error::InvalidRepository(repo.to_string()));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), Error> {
    if tag.is_empty() || tag.len() > 128 {
        return Err(Error::InvalidTag(tag.to_string()));
    }
    let mut chars = tag.bytes();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphanumeric() || first == b'_') {
        return Err(Error::InvalidTag(tag.to_string()));
    }
    if !tag.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-') {
        return Err(Error::InvalidTag(tag.to_string()));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<(), Error> {
    digest
        .parse::<Digest>()
        .map(|_| ())
        .map_err(|_| Error::InvalidDigest(digest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_form_d_no_tag_no_digest() {
        let r = Reference::parse("quay.io/fedora/fedora").unwrap();
        assert_eq!(r.registry(), "quay.io");
        assert_eq!(r.repository(), "fedora/fedora");
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn parses_form_c_tag() {
        let r = Reference::parse("quay.io/fedora/fedora:42").unwrap();
        assert_eq!(r.tag(), Some("42"));
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn parses_form_a_digest() {
        let r = Reference::parse(
            "quay.io/fedora/fedora@sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        assert_eq!(r.tag(), None);
        assert!(r.digest().is_some());
    }

    #[test]
    fn parses_form_b_drops_tag_keeps_digest() {
        let r = Reference::parse(
            "quay.io/fedora/fedora:latest@sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        assert_eq!(r.tag(), None, "tag must be dropped when digest is present");
        assert!(r.digest().is_some());
        assert_eq!(r.repository(), "fedora/fedora");
    }

    #[test]
    fn rejects_missing_slash() {
        assert!(Reference::parse("fedora").is_err());
    }

    #[test]
    fn docker_io_canonicalises_host() {
        let r = Reference::parse("docker.io/library/alpine:3").unwrap();
        assert_eq!(r.host(), "registry-1.docker.io");
    }

    #[test]
    fn non_docker_host_unchanged() {
        let r = Reference::parse("ghcr.io/foo/bar:1").unwrap();
        assert_eq!(r.host(), "ghcr.io");
    }

    #[test]
    fn rejects_bad_digest() {
        assert!(Reference::parse("quay.io/a/b@sha256:zz").is_err());
    }
}
