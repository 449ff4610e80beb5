//! A Redis key-value backend shared across instances

use std::fmt;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use weixin_clock::DurationSecs;

use super::KeyValueStore;
use crate::error::BoxError;

/// A key-value store backed by Redis
///
/// Every instance pointed at the same Redis sees the same credentials, so a
/// token refreshed by one instance is served by all of them.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Wraps an existing connection manager
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Connects to the Redis server at `url`
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::new(connection))
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<DurationSecs>,
    ) -> Result<(), BoxError> {
        let mut connection = self.connection.clone();
        match ttl {
            Some(ttl) if ttl.0 > 0 => {
                let _: () = connection.set_ex(key, value, ttl.0).await?;
            }
            _ => {
                let _: () = connection.set(key, value).await?;
            }
        }
        Ok(())
    }
}
