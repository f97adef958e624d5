use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{trace, warn};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, Request, Response, StatusCode};
use serde::Deserialize;

use super::{CacheKey, Error, Scope, Token, TokenCache};
use crate::auth::challenge::{self, Challenge};

#[derive(Debug, Clone)]
pub enum Credentials {
    None,
    UserPass(String, String),
    RefreshToken(String),
}

pub type CredentialMap = BTreeMap<String, Credentials>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemeKind {
    Basic,
    Bearer,
}

type SchemeMap = BTreeMap<String, SchemeKind>;

/// Wraps a transport with WWW-Authenticate challenge handling, token acquisition, and
/// at-most-one 401 retry, generalising the bearer-only interceptor in the teacher's own
/// pull client to also support Basic auth and caller-supplied custom headers.
#[derive(Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    token_cache: TokenCache,
    credentials: Arc<ArcSwap<CredentialMap>>,
    custom_headers: Arc<ArcSwap<HeaderMap>>,
    // remembers which scheme a 401 on this authority last challenged with, so a cache probe
    // ahead of the first request on a new call path doesn't have to guess it from whether
    // the caller happened to pass a scope.
    schemes: Arc<ArcSwap<SchemeMap>>,
    user_agent: String,
}

impl AuthClient {
    pub fn new(user_agent: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .https_only(false)
            .build()?;
        Ok(AuthClient {
            http,
            token_cache: TokenCache::default(),
            credentials: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
            custom_headers: Arc::new(ArcSwap::from_pointee(HeaderMap::new())),
            schemes: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
            user_agent: user_agent.into(),
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn set_credentials(&self, credentials: CredentialMap) {
        self.credentials.store(credentials.into());
    }

    pub fn set_custom_headers(&self, headers: HeaderMap) {
        self.custom_headers.store(headers.into());
    }

    /// Sends `request`, attaching a cached token for `authority`/`scope` first. On a 401
    /// with a valid challenge, acquires a token and retries exactly once.
    pub async fn send(
        &self,
        authority: &str,
        scope: Option<&Scope>,
        mut request: Request,
    ) -> Result<Response, Error> {
        if request.headers().contains_key(header::AUTHORIZATION) {
            self.apply_custom_headers(request.headers_mut());
            return Ok(self.http.execute(request).await?);
        }

        let retry = request.try_clone();

        if let Some(token) = self.cached_token(authority, scope).await {
            request
                .headers_mut()
                .insert(header::AUTHORIZATION, bearer_or_basic_header(&token)?);
        }
        self.apply_custom_headers(request.headers_mut());

        let response = self.http.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(retry) = retry else {
            return Ok(response);
        };

        let www_auth = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingChallenge)?;
        let parsed = challenge::parse(www_auth)?;

        let token = self.acquire_token(authority, &parsed, scope).await?;

        let mut retry = retry;
        retry
            .headers_mut()
            .insert(header::AUTHORIZATION, bearer_or_basic_header(&token)?);
        self.apply_custom_headers(retry.headers_mut());
        Ok(self.http.execute(retry).await?)
    }

    fn apply_custom_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in self.custom_headers.load().iter() {
            headers.insert(name.clone(), value.clone());
        }
    }

    /// Picks the cache bucket by the scheme this authority last challenged with, not by
    /// whether the caller happened to pass a scope: a Basic-scheme registry never issues a
    /// bearer challenge, so probing the bearer bucket there would never hit, and every call
    /// would re-authenticate from scratch.
    async fn cached_token(&self, authority: &str, scope: Option<&Scope>) -> Option<Token> {
        match (self.scheme_for(authority), scope) {
            (Some(SchemeKind::Basic), _) => self.token_cache.get(&CacheKey::basic(authority)).await,
            (Some(SchemeKind::Bearer), Some(scope)) => {
                self.token_cache
                    .get(&CacheKey::bearer(authority, scope.actions_serialized()))
                    .await
            }
            (Some(SchemeKind::Bearer), None) => None,
            (None, Some(scope)) => {
                self.token_cache
                    .get(&CacheKey::bearer(authority, scope.actions_serialized()))
                    .await
            }
            (None, None) => self.token_cache.get(&CacheKey::basic(authority)).await,
        }
    }

    fn scheme_for(&self, authority: &str) -> Option<SchemeKind> {
        self.schemes.load().get(authority).copied()
    }

    fn remember_scheme(&self, authority: &str, scheme: SchemeKind) {
        let current = self.schemes.load();
        if current.get(authority) == Some(&scheme) {
            return;
        }
        let mut next = (**current).clone();
        next.insert(authority.to_string(), scheme);
        self.schemes.store(Arc::new(next));
    }

    async fn acquire_token(
        &self,
        authority: &str,
        challenge: &Challenge,
        scope: Option<&Scope>,
    ) -> Result<Token, Error> {
        match challenge {
            Challenge::Basic => {
                self.remember_scheme(authority, SchemeKind::Basic);
                let creds = self.credential_for(authority);
                let (user, pass) = match creds {
                    Credentials::UserPass(u, p) => (u, p),
                    _ => return Err(Error::AuthenticationFailed),
                };
                let key = CacheKey::basic(authority);
                let value = base64_basic(&user, &pass);
                self.token_cache
                    .get_with(key, async move {
                        Ok(Token {
                            value,
                            expires_in: Duration::from_secs(u64::MAX / 2),
                        })
                    })
                    .await
            }
            Challenge::Bearer { realm, service, .. } => {
                self.remember_scheme(authority, SchemeKind::Bearer);
                let scope_key = scope.map(|s| s.actions_serialized()).unwrap_or_default();
                let key = CacheKey::bearer(authority, &scope_key);
                let creds = self.credential_for(authority);
                let http = self.http.clone();
                let realm = realm.clone();
                let service = service.clone();
                let scope_str = scope.map(|s| s.to_string());
                let client_id = self.user_agent.clone();
                self.token_cache
                    .get_with(key, async move {
                        fetch_token(http, creds, realm, service, scope_str, client_id).await
                    })
                    .await
            }
        }
    }

    fn credential_for(&self, authority: &str) -> Credentials {
        self.credentials
            .load()
            .get(authority)
            .cloned()
            .unwrap_or(Credentials::None)
    }
}

fn bearer_or_basic_header(token: &Token) -> Result<HeaderValue, Error> {
    let is_basic = token.value.starts_with("Basic ");
    let raw = if is_basic {
        token.value.clone()
    } else {
        format!("Bearer {}", token.value)
    };
    HeaderValue::from_str(&raw).map_err(|_| Error::AuthenticationFailed)
}

fn base64_basic(user: &str, pass: &str) -> String {
    use base64::Engine;
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
    )
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "token")]
    access_token: String,
    expires_in: Option<u64>,
}

/// Distribution token (GET) when there's no refresh token on file, else OAuth2 (POST)
/// with grant_type=password or refresh_token, per the token endpoint's two supported flows.
async fn fetch_token(
    http: reqwest::Client,
    creds: Credentials,
    realm: String,
    service: Option<String>,
    scope: Option<String>,
    client_id: String,
) -> Result<Token, Error> {
    let response = match &creds {
        Credentials::None => {
            let mut req = http.request(Method::GET, &realm);
            if let Some(service) = &service {
                req = req.query(&[("service", service)]);
            }
            if let Some(scope) = &scope {
                req = req.query(&[("scope", scope)]);
            }
            trace!("GET {realm} (anonymous distribution token)");
            req.send().await?
        }
        Credentials::UserPass(user, pass) => {
            let mut req = http
                .request(Method::GET, &realm)
                .basic_auth(user, Some(pass));
            if let Some(service) = &service {
                req = req.query(&[("service", service)]);
            }
            if let Some(scope) = &scope {
                req = req.query(&[("scope", scope)]);
            }
            trace!("GET {realm} (distribution token, basic creds)");
            req.send().await?
        }
        Credentials::RefreshToken(refresh_token) => {
            let mut form = vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.clone()),
                ("client_id", client_id),
            ];
            if let Some(service) = &service {
                form.push(("service", service.clone()));
            }
            if let Some(scope) = &scope {
                form.push(("scope", scope.clone()));
            }
            trace!("POST {realm} (oauth2 refresh_token grant)");
            http.request(Method::POST, &realm).form(&form).send().await?
        }
    };

    if !response.status().is_success() {
        return Err(Error::ResponseError {
            method: "GET/POST".to_string(),
            url: realm,
            status: response.status().as_u16(),
        });
    }

    let parsed: TokenResponse = response.json().await?;
    if parsed.access_token.is_empty() {
        return Err(Error::AuthenticationFailed);
    }
    // https://distribution.github.io/distribution/spec/auth/token/#token-response-fields
    // default is 60 seconds when not specified
    Ok(Token {
        value: parsed.access_token,
        expires_in: Duration::from_secs(parsed.expires_in.unwrap_or(60)),
    })
}
