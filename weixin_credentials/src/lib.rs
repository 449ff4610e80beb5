//! Lazily refreshed Weixin credentials shared across tasks and instances
//!
//! A third-party platform on the Weixin open platform juggles several
//! short-lived secrets: its own component access token, an access token for
//! every account that authorized it, and a JS-SDK ticket for each of those
//! accounts. Each is issued by a rate-limited endpoint, lives for about two
//! hours, and must not be requested by every caller that happens to need it.
//!
//! [`CredentialCache`] keeps each credential in a shared key-value store
//! together with a local expiry that runs ahead of the authority's own by a
//! safety margin. Reads of a fresh credential go straight to the store. When a
//! credential is missing or stale, a single refresh is run for it and every
//! concurrent caller waits for that refresh instead of starting their own.
//!
//! Refreshes run on their own task, so a caller that gives up does not cancel
//! the refresh others are waiting on. Transient failures are retried with
//! backoff, each attempt is bounded by a timeout, and when a refresh fails the
//! callers that were merely waiting on it are handed the previous value.
//!
//! # Usage
//!
//! Construct the cache once at start-up and hand out clones. The component
//! verify ticket pushed to the platform's callback URL must be recorded as it
//! arrives, since it is needed to obtain a component access token.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use weixin_credentials::{
//!     store::InMemoryStore, AppIdRef, CacheConfig, ComponentCredentials, CredentialCache,
//!     VerifyTicketRef, WeixinClient,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = ComponentCredentials::new("wx-component-appid", "component-secret")?;
//! let provider = WeixinClient::new(reqwest::Client::new(), credentials);
//!
//! let cache = CredentialCache::new(
//!     provider,
//!     Arc::new(InMemoryStore::new()),
//!     CacheConfig::default(),
//! );
//!
//! cache
//!     .update_component_verify_ticket(VerifyTicketRef::from_str("ticket@@@pushed-by-weixin"))
//!     .await?;
//!
//! let token = cache.get_component_access_token().await?;
//! tracing::info!(token = format_args!("{:#?}", token), "component access token");
//!
//! let ticket = cache
//!     .get_js_api_ticket(AppIdRef::from_str("wx-authorizer-appid"))
//!     .await?;
//! # let _ = ticket;
//! # Ok(())
//! # }
//! ```
//!
//! Calls made with a cached credential can be wrapped with
//! [`CredentialCache::with_credential`], which replaces the credential and
//! retries once when the call reports it as rejected.
//!
//! # Features
//!
//! * `weixin` (default): Provides [`WeixinClient`], a [`CredentialProvider`]
//!   speaking to the Weixin open platform API.
//! * `redis`: Provides [`RedisStore`][store::RedisStore], a key-value backend
//!   shared by every instance pointed at the same Redis server.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
mod cache;
mod config;
pub mod error;
pub mod jsapi;
mod kind;
pub mod provider;
pub mod refresh;
pub mod store;

pub use braids::*;
pub use cache::{CredentialCache, CredentialState};
pub use config::{CacheConfig, ComponentCredentials};
pub use error::{CallError, ConfigError, CredentialError, FetchError, RejectsCredential, StoreError};
pub use kind::CredentialKind;
#[cfg(feature = "weixin")]
#[cfg_attr(docsrs, doc(cfg(feature = "weixin")))]
pub use provider::WeixinClient;
pub use provider::{AuthorizationGrant, CredentialProvider, FetchedCredential};
