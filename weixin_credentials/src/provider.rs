//! Authorities that issue credentials

use async_trait::async_trait;
use weixin_clock::DurationSecs;

use crate::{
    error::FetchError, AppId, AppIdRef, AuthCodeRef, PreAuthCode, RefreshToken, RefreshTokenRef,
    Secret, SecretRef, VerifyTicketRef,
};

#[cfg(feature = "weixin")]
pub mod weixin;

#[cfg(feature = "weixin")]
#[cfg_attr(docsrs, doc(cfg(feature = "weixin")))]
pub use weixin::WeixinClient;

/// A credential as issued by the authority
#[derive(Clone, Debug)]
pub struct FetchedCredential {
    /// The credential value
    pub value: Secret,
    /// How long the authority will accept the credential
    pub lifetime: DurationSecs,
    /// A replacement refresh token, when the authority rotates it
    pub refresh_token: Option<RefreshToken>,
}

impl FetchedCredential {
    /// A credential without a rotated refresh token
    pub fn new(value: Secret, lifetime: DurationSecs) -> Self {
        Self {
            value,
            lifetime,
            refresh_token: None,
        }
    }

    /// Attaches a rotated refresh token
    pub fn with_refresh_token(mut self, refresh_token: RefreshToken) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }
}

/// The outcome of exchanging an authorization code
///
/// Holds the first authorizer access token for the account along with the
/// refresh token used to renew it.
#[derive(Clone, Debug)]
pub struct AuthorizationGrant {
    /// The appid of the account that authorized the platform
    pub authorizer_appid: AppId,
    /// The account's first access token
    pub access_token: Secret,
    /// How long `access_token` will be accepted
    pub lifetime: DurationSecs,
    /// The refresh token used to renew the access token
    pub refresh_token: RefreshToken,
}

/// An authority issuing platform credentials
///
/// Implementations perform a single request per call. Caching, retries and
/// concurrency control are handled by [`CredentialCache`](crate::CredentialCache).
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// Exchanges the latest verify ticket for a component access token
    async fn component_access_token(
        &self,
        verify_ticket: &VerifyTicketRef,
    ) -> Result<FetchedCredential, FetchError>;

    /// Renews the access token of an authorized account
    async fn authorizer_access_token(
        &self,
        component_access_token: &SecretRef,
        authorizer_appid: &AppIdRef,
        refresh_token: &RefreshTokenRef,
    ) -> Result<FetchedCredential, FetchError>;

    /// Obtains a JS-SDK ticket for the account owning `authorizer_access_token`
    async fn js_api_ticket(
        &self,
        authorizer_access_token: &SecretRef,
    ) -> Result<FetchedCredential, FetchError>;

    /// Creates a pre-authorization code for a visit to the authorization page
    async fn pre_auth_code(
        &self,
        component_access_token: &SecretRef,
    ) -> Result<PreAuthCode, FetchError>;

    /// Exchanges an authorization code for an account's first credentials
    async fn query_auth(
        &self,
        component_access_token: &SecretRef,
        auth_code: &AuthCodeRef,
    ) -> Result<AuthorizationGrant, FetchError>;
}
