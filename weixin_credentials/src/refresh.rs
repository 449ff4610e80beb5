//! Single-flight refresh of stored credentials
//!
//! Each store key gets its own refresh slot: an async mutex guarding the
//! fetch-and-store sequence, plus a count of finished refresh attempts. Reads
//! of fresh values never touch the slot.
//!
//! The fetch runs on a spawned task that owns the slot's lock, so callers
//! that give up waiting do not cancel a refresh other callers depend on. The
//! lock is released when that task finishes, fails or panics.

use std::{
    error,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use weixin_clock::{Clock, System};

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler, WithBackoff},
    error::{CredentialError, FetchError, StoreError},
    provider::FetchedCredential,
    store::ExpiringSecretStore,
    Secret, SecretRef,
};

/// Where a returned credential came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The stored value was still fresh
    Cached,
    /// The value was just fetched from the authority
    Fetched,
    /// A concurrent refresh failed; this is the last value stored, past its expiry
    Degraded,
}

/// The outcome of a refresh request
#[derive(Debug)]
pub struct Refreshed {
    secret: Secret,
    origin: Origin,
    persist_error: Option<StoreError>,
}

impl Refreshed {
    fn new(secret: Secret, origin: Origin) -> Self {
        Self {
            secret,
            origin,
            persist_error: None,
        }
    }

    /// The credential value
    #[inline]
    pub fn secret(&self) -> &SecretRef {
        &self.secret
    }

    /// Consumes the outcome, returning the credential value
    #[inline]
    pub fn into_secret(self) -> Secret {
        self.secret
    }

    /// Where the credential came from
    #[inline]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// The error raised when a freshly fetched value could not be stored
    ///
    /// The value is still usable, but other callers and instances will not see
    /// it and will fetch again.
    #[inline]
    pub fn persist_error(&self) -> Option<&StoreError> {
        self.persist_error.as_ref()
    }
}

#[derive(Debug, Default)]
struct Slot {
    lock: Arc<Mutex<()>>,
    attempts: AtomicU64,
}

/// Held by the refresh task for the duration of one attempt
struct InFlight {
    slot: Arc<Slot>,
    _lock: OwnedMutexGuard<()>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // Counted before the lock field is released.
        self.slot.attempts.fetch_add(1, Ordering::AcqRel);
    }
}

enum Mode {
    IfNeeded,
    Force,
    Rejected(Secret),
}

/// Ensures at most one refresh per key is in flight at a time
#[derive(Debug)]
pub struct SingleFlight<C = System> {
    store: ExpiringSecretStore<C>,
    slots: DashMap<String, Arc<Slot>>,
    fetch_timeout: Duration,
    backoff: ErrorBackoffConfig,
}

impl<C> SingleFlight<C> {
    /// Constructs a refresher writing to `store`
    ///
    /// Each fetch attempt is cut off after `fetch_timeout`; transient failures
    /// are retried according to `backoff`.
    pub fn new(
        store: ExpiringSecretStore<C>,
        fetch_timeout: Duration,
        backoff: ErrorBackoffConfig,
    ) -> Self {
        Self {
            store,
            slots: DashMap::new(),
            fetch_timeout,
            backoff,
        }
    }

    /// The underlying store
    pub fn store(&self) -> &ExpiringSecretStore<C> {
        &self.store
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(&slot);
        }
        Arc::clone(&self.slots.entry(key.to_owned()).or_default())
    }
}

impl<C> SingleFlight<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Returns the value at `key`, fetching a new one if it is missing or expired
    ///
    /// Concurrent callers for the same key share a single fetch. If that fetch
    /// fails, the caller that started it receives the error while callers that
    /// were waiting on it receive the last stored value, if there is one.
    pub async fn refresh_if_needed<F, Fut>(
        &self,
        key: &str,
        fetch: F,
    ) -> Result<Refreshed, CredentialError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FetchedCredential, FetchError>> + Send + 'static,
    {
        self.run(key, Mode::IfNeeded, fetch).await
    }

    /// Invalidates the value at `key` and fetches a new one
    pub async fn force_refresh<F, Fut>(
        &self,
        key: &str,
        fetch: F,
    ) -> Result<Refreshed, CredentialError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FetchedCredential, FetchError>> + Send + 'static,
    {
        self.run(key, Mode::Force, fetch).await
    }

    /// Replaces a value the remote API reported as rejected
    ///
    /// If another caller already replaced `rejected` with a fresh value, that
    /// value is returned without fetching.
    pub async fn refresh_rejected<F, Fut>(
        &self,
        key: &str,
        rejected: &SecretRef,
        fetch: F,
    ) -> Result<Refreshed, CredentialError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FetchedCredential, FetchError>> + Send + 'static,
    {
        self.run(key, Mode::Rejected(rejected.to_owned()), fetch)
            .await
    }

    async fn run<F, Fut>(&self, key: &str, mode: Mode, fetch: F) -> Result<Refreshed, CredentialError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FetchedCredential, FetchError>> + Send + 'static,
    {
        if let Mode::IfNeeded = mode {
            if let Some(secret) = self.store.fresh(key).await {
                tracing::trace!(key, "credential is fresh");
                return Ok(Refreshed::new(secret, Origin::Cached));
            }
        }

        let slot = self.slot(key);
        let observed = slot.attempts.load(Ordering::Acquire);
        let lock = Arc::clone(&slot.lock).lock_owned().await;

        match mode {
            Mode::IfNeeded => {
                if let Some(secret) = self.store.fresh(key).await {
                    tracing::debug!(key, "credential was refreshed while waiting");
                    return Ok(Refreshed::new(secret, Origin::Cached));
                }
                if slot.attempts.load(Ordering::Acquire) != observed {
                    drop(lock);
                    return self.degrade(key).await;
                }
            }
            Mode::Force => self.invalidate(key).await,
            Mode::Rejected(rejected) => {
                let now = self.store.clock().now();
                match self.store.get(key).await {
                    Ok(Some(record))
                        if record.value() != &*rejected && !record.is_expired_at(now) =>
                    {
                        tracing::debug!(key, "rejected credential was already replaced");
                        return Ok(Refreshed::new(record.into_value(), Origin::Cached));
                    }
                    _ => self.invalidate(key).await,
                }
            }
        }

        let in_flight = InFlight { slot, _lock: lock };
        let task = tokio::spawn(refresh(
            self.store.clone(),
            key.to_owned(),
            self.fetch_timeout,
            self.backoff.clone(),
            fetch,
            in_flight,
        ));

        match task.await {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(
                    key,
                    error = (&error as &dyn error::Error),
                    "credential refresh task did not complete"
                );
                Err(CredentialError::Aborted {
                    key: key.to_owned(),
                })
            }
        }
    }

    async fn degrade(&self, key: &str) -> Result<Refreshed, CredentialError> {
        match self.store.get(key).await {
            Ok(Some(record)) => {
                tracing::warn!(
                    key,
                    expires_at = record.expires_at().0,
                    "concurrent refresh failed, serving the previous credential"
                );
                Ok(Refreshed::new(record.into_value(), Origin::Degraded))
            }
            Ok(None) => Err(CredentialError::Unavailable {
                key: key.to_owned(),
            }),
            Err(error) => {
                tracing::warn!(
                    key,
                    error = (&error as &dyn error::Error),
                    "concurrent refresh failed and the previous credential is unreadable"
                );
                Err(CredentialError::Unavailable {
                    key: key.to_owned(),
                })
            }
        }
    }

    async fn invalidate(&self, key: &str) {
        if let Err(error) = self.store.invalidate(key).await {
            tracing::warn!(
                key,
                error = (&error as &dyn error::Error),
                "unable to invalidate credential before refreshing"
            );
        }
    }
}

async fn refresh<C, F, Fut>(
    store: ExpiringSecretStore<C>,
    key: String,
    fetch_timeout: Duration,
    backoff: ErrorBackoffConfig,
    fetch: F,
    _in_flight: InFlight,
) -> Result<Refreshed, CredentialError>
where
    C: Clock,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<FetchedCredential, FetchError>>,
{
    let mut backoff = ErrorBackoffHandler::new(backoff);

    let fetched = loop {
        tracing::debug!(key = %key, attempt = backoff.failures() + 1, "fetching credential");

        let result = match tokio::time::timeout(fetch_timeout, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(fetch_timeout)),
        };

        match result.with_backoff(&mut backoff) {
            Ok(fetched) => break fetched,
            Err((error, Some(delay))) if error.is_transient() => {
                tracing::warn!(
                    key = %key,
                    error = (&error as &dyn error::Error),
                    delay_ms = delay.as_millis() as u64,
                    "error fetching credential, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err((error, _)) => {
                tracing::warn!(
                    key = %key,
                    error = (&error as &dyn error::Error),
                    attempts = backoff.failures(),
                    "unable to fetch credential"
                );
                return Err(CredentialError::Fetch { key, source: error });
            }
        }
    };

    match store.set(&key, &fetched.value, fetched.lifetime).await {
        Ok(record) => {
            tracing::info!(
                key = %key,
                lifetime = fetched.lifetime.0,
                expires_at = record.expires_at().0,
                "fetched new credential"
            );
            Ok(Refreshed::new(record.into_value(), Origin::Fetched))
        }
        Err(error) => {
            tracing::error!(
                key = %key,
                error = (&error as &dyn error::Error),
                "fetched credential could not be stored"
            );
            Ok(Refreshed {
                secret: fetched.value,
                origin: Origin::Fetched,
                persist_error: Some(error),
            })
        }
    }
}
