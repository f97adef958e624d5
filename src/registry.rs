use log::trace;
use reqwest::{Method, StatusCode, header};

use crate::auth::{AuthClient, Credentials, CredentialMap, Scope};
use crate::reference::Reference;
use crate::remote::{RemoteRepository, RepositoryOptions};
use crate::url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Auth(#[from] crate::auth::Error),
    Reqwest(#[from] reqwest::Error),
    Reference(#[from] crate::reference::Error),
    MissingLocation,
    ResponseError { method: String, url: String, status: u16 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub struct RegistryOptions {
    pub plain_http: bool,
    pub manifest_accept: Vec<&'static str>,
    pub tag_page_size: Option<u32>,
    pub max_metadata_bytes: u64,
    pub user_agent: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        let repo = RepositoryOptions::default();
        RegistryOptions {
            plain_http: repo.plain_http,
            manifest_accept: repo.manifest_accept,
            tag_page_size: repo.tag_page_size,
            max_metadata_bytes: repo.max_metadata_bytes,
            user_agent: repo.user_agent,
        }
    }
}

/// Binds a transport and a registry host, handing out `RemoteRepository` instances for
/// individual repositories and exposing the two registry-wide endpoints, `/v2/` and
/// `/v2/_catalog`.
#[derive(Clone)]
pub struct Registry {
    auth: AuthClient,
    authority: String,
    options: std::sync::Arc<RegistryOptions>,
}

impl Registry {
    pub fn new(authority: impl Into<String>, options: RegistryOptions) -> Result<Self, Error> {
        let authority = authority.into();
        let auth = AuthClient::new(options.user_agent.clone())?;
        Ok(Registry {
            auth,
            authority,
            options: options.into(),
        })
    }

    pub fn set_credentials(&self, credentials: CredentialMap) {
        self.auth.set_credentials(credentials);
    }

    pub fn set_credential(&self, authority: impl Into<String>, credentials: Credentials) {
        let mut map = CredentialMap::new();
        map.insert(authority.into(), credentials);
        self.auth.set_credentials(map);
    }

    /// `RemoteRepository` for `repository`, sharing this registry's transport and auth state.
    pub fn repository(&self, repository: &str) -> Result<RemoteRepository, Error> {
        let reference = Reference::parse(&format!("{}/{}", self.authority, repository))?;
        let options = RepositoryOptions {
            plain_http: self.options.plain_http,
            manifest_accept: self.options.manifest_accept.clone(),
            tag_page_size: self.options.tag_page_size,
            max_metadata_bytes: self.options.max_metadata_bytes,
            user_agent: self.options.user_agent.clone(),
        };
        Ok(RemoteRepository::new(self.auth.clone(), reference, options))
    }

    /// GET `/v2/`, the baseline API-version check. A 401 here is resolved without a
    /// repository scope, matching the distribution spec's catalog-level auth model.
    pub async fn ping(&self) -> Result<bool, Error> {
        let u = url::ping(&self.authority, self.options.plain_http);
        trace!("GET {u}");
        let request = self.auth.http().request(Method::GET, &u).build()?;
        let response = self.auth.send(&self.authority, None, request).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => Ok(false),
            status => Err(response_error("GET", &u, status)),
        }
    }

    /// Invokes `page` with each batch of repository names from `/v2/_catalog`, following
    /// `Link` headers the same way `RemoteRepository::tags_list` does.
    pub async fn repositories(&self, mut page: impl FnMut(Vec<String>)) -> Result<(), Error> {
        #[derive(serde::Deserialize)]
        struct CatalogResponse {
            repositories: Vec<String>,
        }
        let scope = Scope::new("registry", "catalog", &["*"]);
        let mut next = {
            let mut u = url::catalog(&self.authority, self.options.plain_http);
            if let Some(n) = self.options.tag_page_size {
                u = format!("{u}?n={n}");
            }
            u.parse().map_err(|_| Error::MissingLocation)?
        };
        loop {
            trace!("GET {next}");
            let request = self.auth.http().request(Method::GET, next).build()?;
            let response = self.auth.send(&self.authority, Some(&scope), request).await?;
            if response.status() != StatusCode::OK {
                return Err(response_error("GET", response.url().as_str(), response.status()));
            }
            let link = response
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let request_url = response.url().clone();
            let body: CatalogResponse = response.json().await?;
            page(body.repositories);
            match url::next_page(link.as_deref(), &request_url).map_err(|_| Error::MissingLocation)? {
                Some(n) => next = n,
                None => break,
            }
        }
        Ok(())
    }
}

fn response_error(method: &str, url: &str, status: StatusCode) -> Error {
    Error::ResponseError {
        method: method.to_string(),
        url: url.to_string(),
        status: status.as_u16(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_inherits_registry_options() {
        let registry = Registry::new(
            "registry.example.com",
            RegistryOptions {
                plain_http: true,
                tag_page_size: Some(50),
                ..Default::default()
            },
        )
        .unwrap();
        let repo = registry.repository("library/busybox").unwrap();
        assert_eq!(repo.repository(), "library/busybox");
    }
}
