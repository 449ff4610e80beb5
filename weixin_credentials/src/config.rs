//! Configuration for the credential cache and the platform identity

use std::time::Duration;

use weixin_clock::DurationSecs;

use crate::{backoff::ErrorBackoffConfig, error::ConfigError, AppId, AppIdRef, AppSecret, AppSecretRef};

/// Tunables for caching and refreshing credentials
#[derive(Clone, Debug)]
pub struct CacheConfig {
    namespace: String,
    safety_margin: DurationSecs,
    fetch_timeout: Duration,
    backoff: ErrorBackoffConfig,
}

impl Default for CacheConfig {
    /// Default cache configuration
    ///
    /// Keys live under the `weixin` namespace. Credentials are considered expired
    /// 200 seconds before the authority says they are, each fetch attempt is given
    /// 10 seconds, and failed fetches follow [`ErrorBackoffConfig::default`].
    fn default() -> Self {
        Self {
            namespace: "weixin".to_string(),
            safety_margin: DurationSecs(200),
            fetch_timeout: Duration::from_secs(10),
            backoff: ErrorBackoffConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Overrides the key namespace, e.g. to share one store between platforms
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Overrides the margin subtracted from every credential lifetime
    pub fn with_safety_margin(mut self, safety_margin: DurationSecs) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    /// Overrides the time allowed for a single fetch attempt
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Overrides the retry policy for failed fetches
    pub fn with_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// The key namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The margin subtracted from every credential lifetime
    pub fn safety_margin(&self) -> DurationSecs {
        self.safety_margin
    }

    /// The time allowed for a single fetch attempt
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// The retry policy for failed fetches
    pub fn backoff(&self) -> &ErrorBackoffConfig {
        &self.backoff
    }
}

/// The third-party platform's own identity
#[derive(Clone, Debug)]
pub struct ComponentCredentials {
    component_appid: AppId,
    component_appsecret: AppSecret,
}

impl ComponentCredentials {
    /// Validates and wraps the platform's appid and secret
    pub fn new(
        component_appid: impl Into<String>,
        component_appsecret: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let component_appid = component_appid.into();
        let component_appsecret = component_appsecret.into();

        if component_appid.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "component_appid",
            });
        }
        if component_appsecret.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "component_appsecret",
            });
        }

        Ok(Self {
            component_appid: AppId::new(component_appid),
            component_appsecret: AppSecret::new(component_appsecret),
        })
    }

    /// The platform's appid
    pub fn component_appid(&self) -> &AppIdRef {
        &self.component_appid
    }

    /// The platform's app secret
    pub fn component_appsecret(&self) -> &AppSecretRef {
        &self.component_appsecret
    }
}
