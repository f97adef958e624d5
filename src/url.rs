use reqwest::Url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    BadUrl(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn base(host: &str, plain_http: bool) -> String {
    let scheme = if plain_http { "http" } else { "https" };
    format!("{scheme}://{host}")
}

pub fn ping(host: &str, plain_http: bool) -> String {
    format!("{}/v2/", base(host, plain_http))
}

pub fn catalog(host: &str, plain_http: bool) -> String {
    format!("{}/v2/_catalog", base(host, plain_http))
}

pub fn tags_list(host: &str, plain_http: bool, repository: &str) -> String {
    format!("{}/v2/{repository}/tags/list", base(host, plain_http))
}

pub fn manifest(host: &str, plain_http: bool, repository: &str, reference: &str) -> String {
    format!("{}/v2/{repository}/manifests/{reference}", base(host, plain_http))
}

pub fn blob(host: &str, plain_http: bool, repository: &str, digest: &str) -> String {
    format!("{}/v2/{repository}/blobs/{digest}", base(host, plain_http))
}

pub fn blob_upload_init(host: &str, plain_http: bool, repository: &str) -> String {
    format!("{}/v2/{repository}/blobs/uploads/", base(host, plain_http))
}

pub fn blob_upload_init_with_mount(
    host: &str,
    plain_http: bool,
    repository: &str,
    mount_digest: &str,
    from_repository: &str,
) -> String {
    format!(
        "{}?mount={mount_digest}&from={from_repository}",
        blob_upload_init(host, plain_http, repository)
    )
}

/// Parses the first `rel="next"` entry of an RFC 5988 `Link` header and resolves it
/// against the scheme+authority of the request that produced it. Absence of a `Link`
/// header is the normal end-of-pages signal, not an error — callers see `Ok(None)`.
pub fn next_page(link_header: Option<&str>, request_url: &Url) -> Result<Option<Url>, Error> {
    let Some(header) = link_header else {
        return Ok(None);
    };
    let Some(raw) = parse_link_next(header) else {
        return Ok(None);
    };
    let resolved = request_url
        .join(raw)
        .map_err(|e| Error::BadUrl(e.to_string()))?;
    Ok(Some(resolved))
}

fn parse_link_next(input: &str) -> Option<&str> {
    use nom::{
        IResult, Parser,
        bytes::complete::{tag, take_until1},
        character::complete::char,
        sequence::delimited,
    };
    fn url_part(input: &str) -> IResult<&str, &str> {
        delimited(char('<'), take_until1(">"), char('>')).parse(input)
    }
    for entry in input.split(',') {
        let entry = entry.trim();
        if let Ok((rest, url)) = url_part(entry) {
            if rest.contains("rel=\"next\"") || rest.contains("rel=next") {
                return Some(url);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_manifest_url() {
        assert_eq!(
            manifest("registry-1.docker.io", false, "library/alpine", "3.19"),
            "https://registry-1.docker.io/v2/library/alpine/manifests/3.19"
        );
    }

    #[test]
    fn builds_plain_http_url() {
        assert_eq!(ping("localhost:5000", true), "http://localhost:5000/v2/");
    }

    #[test]
    fn parses_link_next_relative() {
        let request: Url = "https://registry.example/v2/_catalog?n=100".parse().unwrap();
        let header = "</v2/_catalog?n=100&last=zzz>; rel=\"next\"";
        let next = next_page(Some(header), &request).unwrap().unwrap();
        assert_eq!(next.as_str(), "https://registry.example/v2/_catalog?n=100&last=zzz");
    }

    #[test]
    fn missing_link_header_ends_pagination() {
        let request: Url = "https://registry.example/v2/_catalog".parse().unwrap();
        assert!(next_page(None, &request).unwrap().is_none());
    }
}
