pub mod cache;
pub mod challenge;
pub mod client;
pub mod scope;

pub use cache::{CacheKey, Token, TokenCache};
pub use challenge::Challenge;
pub use client::{AuthClient, Credentials};
pub use scope::Scope;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
    Challenge(#[from] challenge::Error),
    AuthenticationFailed,
    MissingChallenge,
    ResponseError {
        method: String,
        url: String,
        status: u16,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
