//! Error types for each layer of the credential cache

use std::{error, time::Duration};

use thiserror::Error;

/// A boxed error from a pluggable backend or transport
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Weixin error codes meaning the credential sent with a request is no longer accepted
const REJECTED_CREDENTIAL_CODES: &[i64] = &[
    40001, // invalid credential
    40014, // invalid access_token
    42001, // access_token expired
];

/// Weixin error code meaning the platform is busy; safe to retry
const SYSTEM_BUSY: i64 = -1;

/// An error reading or writing the shared key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed to complete the operation
    #[error("credential store backend error")]
    Backend(#[source] BoxError),
    /// A stored record could not be decoded
    #[error("stored credential record at `{key}` is corrupt")]
    Corrupt {
        /// The key holding the record
        key: String,
        /// The decoding error
        #[source]
        source: serde_json::Error,
    },
    /// A record could not be encoded for storage
    #[error("unable to encode credential record for `{key}`")]
    Encode {
        /// The key the record was meant for
        key: String,
        /// The encoding error
        #[source]
        source: serde_json::Error,
    },
}

/// An error while fetching a credential from the issuing authority
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request could not be sent or its response could not be read
    #[error("error communicating with the credential authority")]
    Transport(#[source] BoxError),
    /// The authority did not answer in time
    #[error("credential request timed out after {0:?}")]
    Timeout(Duration),
    /// The authority answered with an error code
    #[error("weixin error {code}: {message}")]
    Weixin {
        /// The `errcode` value
        code: i64,
        /// The `errmsg` value, for diagnostics only
        message: String,
    },
    /// The response body was not understood
    #[error("error decoding credential response")]
    Decode(#[from] serde_json::Error),
    /// A value required to make the request has never been provided
    #[error("missing {0}")]
    MissingInput(&'static str),
    /// A credential this request depends on could not be obtained
    #[error("prerequisite credential unavailable")]
    Prerequisite(#[source] Box<CredentialError>),
}

impl FetchError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Weixin { code, .. } => *code == SYSTEM_BUSY,
            Self::Prerequisite(inner) => inner.is_transient(),
            Self::Decode(_) | Self::MissingInput(_) => false,
        }
    }
}

/// Errors which can report that the credential used for a call was rejected
///
/// Implement this for the error type of calls made through
/// [`CredentialCache::with_credential`](crate::CredentialCache::with_credential)
/// so that a rejected credential is replaced instead of being served again.
pub trait RejectsCredential {
    /// Whether the remote API rejected the credential itself
    fn rejects_credential(&self) -> bool;
}

impl RejectsCredential for FetchError {
    fn rejects_credential(&self) -> bool {
        matches!(self, Self::Weixin { code, .. } if REJECTED_CREDENTIAL_CODES.contains(code))
    }
}

/// An error obtaining a credential from the cache
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Fetching a new value failed; the stored record was left untouched
    #[error("unable to refresh credential `{key}`")]
    Fetch {
        /// The store key of the credential
        key: String,
        /// The underlying fetch error
        #[source]
        source: FetchError,
    },
    /// A concurrent refresh failed and no earlier value exists to fall back on
    #[error("credential `{key}` is temporarily unavailable")]
    Unavailable {
        /// The store key of the credential
        key: String,
    },
    /// The refresh task panicked or was cancelled before completing
    #[error("refresh of credential `{key}` was aborted")]
    Aborted {
        /// The store key of the credential
        key: String,
    },
    /// Reading or writing an auxiliary value failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CredentialError {
    /// Whether the same request may succeed if retried later
    ///
    /// HTTP-facing callers should answer transient failures with
    /// "service temporarily unavailable".
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { source, .. } => source.is_transient(),
            Self::Unavailable { .. } | Self::Aborted { .. } | Self::Store(_) => true,
        }
    }
}

/// An invalid configuration value
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was empty
    #[error("`{field}` must not be empty")]
    Empty {
        /// The name of the empty field
        field: &'static str,
    },
    /// A base URL could not be parsed
    #[error("invalid base url")]
    InvalidUrl(#[from] url::ParseError),
}

/// An error from an operation run with a cached credential
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The credential could not be obtained
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// The operation itself failed
    #[error("operation using cached credential failed")]
    Call(#[source] E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weixin(code: i64) -> FetchError {
        FetchError::Weixin {
            code,
            message: "test".into(),
        }
    }

    #[test]
    fn expired_tokens_are_rejections() {
        assert!(weixin(40001).rejects_credential());
        assert!(weixin(42001).rejects_credential());
        assert!(!weixin(45009).rejects_credential());
        assert!(!FetchError::Timeout(Duration::from_secs(1)).rejects_credential());
    }

    #[test]
    fn system_busy_and_timeouts_are_transient() {
        assert!(weixin(-1).is_transient());
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!weixin(40013).is_transient());
        assert!(!FetchError::MissingInput("component verify ticket").is_transient());
    }

    #[test]
    fn encoding_failures_do_not_blame_the_stored_record() {
        let source = serde_json::from_str::<u8>("x").unwrap_err();
        let err = StoreError::Encode {
            key: "weixin:component_access_token".into(),
            source,
        };
        let message = err.to_string();
        assert!(message.contains("encode"));
        assert!(!message.contains("corrupt"));
    }

    #[test]
    fn prerequisite_failures_inherit_transience() {
        let inner = CredentialError::Fetch {
            key: "k".into(),
            source: weixin(-1),
        };
        assert!(FetchError::Prerequisite(Box::new(inner)).is_transient());
    }
}
