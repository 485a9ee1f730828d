//! Service layer
//!
//! Concrete implementations of the federation ports for a standalone
//! deployment: the config-driven application, HTTP signature
//! authentication and the rate limiting and key caching behind it.

mod application;
mod authenticator;
mod key_cache;
mod rate_limit;

pub use application::{ConfiguredApplication, INBOX_PAGE_SIZE};
pub use authenticator::HttpSignatureAuthenticator;
pub use key_cache::{ActorKeyCache, SigningKey};
pub use rate_limit::{RateLimiter, domain_key};
