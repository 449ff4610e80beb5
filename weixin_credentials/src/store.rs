//! Expiring secret storage over a shared key-value backend
//!
//! Each credential is kept as one JSON record holding both the value and its
//! local expiry, so readers never see a value paired with another value's
//! expiry. The backend is expected to be shared by every process that uses
//! the same credentials (e.g. Redis); [`InMemoryStore`] serves tests and
//! single-instance deployments.

use std::{error, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use weixin_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    error::{BoxError, StoreError},
    Secret, SecretRef,
};

mod in_memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub use redis_store::RedisStore;

/// A shared key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads the value at `key`
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError>;

    /// Writes `value` at `key`, letting the backend drop it after `ttl` if given
    async fn set(&self, key: &str, value: &str, ttl: Option<DurationSecs>)
        -> Result<(), BoxError>;
}

/// A credential value together with the time it stops being served
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    value: Secret,
    expires_at: UnixTime,
}

impl StoredSecret {
    /// The stored value, regardless of freshness
    #[inline]
    pub fn value(&self) -> &SecretRef {
        &self.value
    }

    /// Consumes the record, returning the value
    #[inline]
    pub fn into_value(self) -> Secret {
        self.value
    }

    /// The time at which the value stops being served
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Whether the value is expired as of `now`
    #[inline]
    pub fn is_expired_at(&self, now: UnixTime) -> bool {
        self.expires_at <= now
    }
}

/// Stores secrets with a locally computed expiry
///
/// Expiry is `now + ttl - safety_margin`, so a credential is never used right
/// up to the authority's own expiry edge.
#[derive(Clone)]
pub struct ExpiringSecretStore<C = System> {
    backend: Arc<dyn KeyValueStore>,
    safety_margin: DurationSecs,
    clock: C,
}

impl ExpiringSecretStore<System> {
    /// Constructs a store over `backend` using the system clock
    pub fn new(backend: Arc<dyn KeyValueStore>, safety_margin: DurationSecs) -> Self {
        Self {
            backend,
            safety_margin,
            clock: System,
        }
    }
}

impl<C> ExpiringSecretStore<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ExpiringSecretStore<D> {
        ExpiringSecretStore {
            backend: self.backend,
            safety_margin: self.safety_margin,
            clock,
        }
    }

    /// The clock used for expiry decisions
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Reads an auxiliary value that has no expiry bookkeeping
    pub async fn get_plain(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.backend.get(key).await.map_err(StoreError::Backend)
    }

    /// Writes an auxiliary value that has no expiry bookkeeping
    pub async fn set_plain(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.backend
            .set(key, value, None)
            .await
            .map_err(StoreError::Backend)
    }

    /// Reads the last stored record, regardless of freshness
    pub async fn get(&self, key: &str) -> Result<Option<StoredSecret>, StoreError> {
        match self.backend.get(key).await.map_err(StoreError::Backend)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    key: key.to_owned(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        key: &str,
        record: &StoredSecret,
        ttl: Option<DurationSecs>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record).map_err(|source| StoreError::Encode {
            key: key.to_owned(),
            source,
        })?;
        self.backend
            .set(key, &raw, ttl)
            .await
            .map_err(StoreError::Backend)
    }
}

impl<C: Clock> ExpiringSecretStore<C> {
    /// The local expiry for a credential issued now with the given lifetime
    ///
    /// Lifetimes no longer than the safety margin keep half of their lifetime
    /// instead of expiring on arrival.
    pub fn expiry_for(&self, ttl: DurationSecs) -> UnixTime {
        let margin = if ttl > self.safety_margin {
            self.safety_margin
        } else {
            tracing::warn!(
                ttl = ttl.0,
                safety_margin = self.safety_margin.0,
                "credential lifetime does not exceed the safety margin, halving it instead"
            );
            DurationSecs(ttl.0 / 2)
        };
        self.clock.now() + (ttl - margin)
    }

    /// Whether the credential at `key` must be refreshed before use
    ///
    /// Read failures count as expired so that a refresh is forced rather than
    /// serving something unverified.
    pub async fn is_expired(&self, key: &str) -> bool {
        self.fresh(key).await.is_none()
    }

    /// Reads the value at `key` if it is still fresh
    pub async fn fresh(&self, key: &str) -> Option<Secret> {
        match self.get(key).await {
            Ok(Some(record)) if !record.is_expired_at(self.clock.now()) => {
                Some(record.into_value())
            }
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(
                    key,
                    error = (&error as &dyn error::Error),
                    "unable to read credential, treating as expired"
                );
                None
            }
        }
    }

    /// Stores `value`, to be served until `ttl` less the safety margin has passed
    pub async fn set(
        &self,
        key: &str,
        value: &SecretRef,
        ttl: DurationSecs,
    ) -> Result<StoredSecret, StoreError> {
        let record = StoredSecret {
            value: value.to_owned(),
            expires_at: self.expiry_for(ttl),
        };
        self.write(key, &record, Some(ttl)).await?;

        tracing::debug!(key, expires_at = record.expires_at.0, "stored credential");
        Ok(record)
    }

    /// Marks the credential at `key` as expired without discarding its value
    pub async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        if let Some(record) = self.get(key).await? {
            let invalidated = StoredSecret {
                expires_at: UnixTime::EPOCH,
                ..record
            };
            self.write(key, &invalidated, None).await?;
            tracing::debug!(key, "invalidated credential");
        }
        Ok(())
    }
}

impl<C: fmt::Debug> fmt::Debug for ExpiringSecretStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ExpiringSecretStore")
            .field("safety_margin", &self.safety_margin)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use weixin_clock::TestClock;

    use super::*;

    fn store(clock: &TestClock) -> ExpiringSecretStore<TestClock> {
        ExpiringSecretStore::new(Arc::new(InMemoryStore::new()), DurationSecs(200))
            .with_clock(clock.clone())
    }

    #[tokio::test]
    async fn value_is_fresh_until_ttl_less_margin() {
        let clock = TestClock::new(UnixTime(1_000));
        let store = store(&clock);

        let record = store
            .set("k", SecretRef::from_str("tok1"), DurationSecs(400))
            .await
            .unwrap();
        assert_eq!(record.expires_at(), UnixTime(1_200));
        assert_eq!(store.fresh("k").await.unwrap().as_str(), "tok1");

        clock.inc(199);
        assert!(!store.is_expired("k").await);

        clock.inc(1);
        assert!(store.is_expired("k").await);
        assert_eq!(
            store.get("k").await.unwrap().unwrap().value().as_str(),
            "tok1"
        );
    }

    #[tokio::test]
    async fn missing_values_are_expired() {
        let clock = TestClock::new(UnixTime(1_000));
        assert!(store(&clock).is_expired("absent").await);
    }

    #[tokio::test]
    async fn invalidate_keeps_the_value() {
        let clock = TestClock::new(UnixTime(1_000));
        let store = store(&clock);
        store
            .set("k", SecretRef::from_str("tok1"), DurationSecs(7_200))
            .await
            .unwrap();

        store.invalidate("k").await.unwrap();

        assert!(store.is_expired("k").await);
        let record = store.get("k").await.unwrap().unwrap();
        assert_eq!(record.value().as_str(), "tok1");
        assert_eq!(record.expires_at(), UnixTime::EPOCH);
    }

    #[tokio::test]
    async fn invalidating_nothing_is_a_no_op() {
        let clock = TestClock::new(UnixTime(1_000));
        let store = store(&clock);
        store.invalidate("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_records_are_expired() {
        let clock = TestClock::new(UnixTime(1_000));
        let backend = Arc::new(InMemoryStore::new());
        backend.set("k", "not json", None).await.unwrap();
        let store = ExpiringSecretStore::new(backend, DurationSecs(200)).with_clock(clock);

        assert!(store.is_expired("k").await);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn short_lifetimes_keep_half() {
        let clock = TestClock::new(UnixTime(1_000));
        let store = store(&clock);
        assert_eq!(store.expiry_for(DurationSecs(100)), UnixTime(1_050));
        assert_eq!(store.expiry_for(DurationSecs(7_200)), UnixTime(8_000));
    }
}
