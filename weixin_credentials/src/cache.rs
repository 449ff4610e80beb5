//! The credential cache shared by everything that calls Weixin APIs

use std::{error, fmt, future::Future, pin::Pin, sync::Arc};

use weixin_clock::{Clock, System};

use crate::{
    config::CacheConfig,
    error::{CallError, CredentialError, FetchError, RejectsCredential, StoreError},
    jsapi::JsApiSignature,
    kind::{refresh_token_key, verify_ticket_key, CredentialKind},
    provider::{AuthorizationGrant, CredentialProvider, FetchedCredential},
    refresh::{Refreshed, SingleFlight},
    store::{ExpiringSecretStore, KeyValueStore},
    AppId, AppIdRef, AuthCodeRef, PreAuthCode, RefreshToken, Secret, SecretRef, VerifyTicket,
    VerifyTicketRef,
};

type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchedCredential, FetchError>> + Send>>;

/// The observable state of a cached credential
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialState {
    /// Nothing has been stored yet
    Absent,
    /// A value is stored and may be served
    Fresh,
    /// A value is stored but must be refreshed before use
    Stale,
}

enum Resolve<'a> {
    IfNeeded,
    Force,
    Rejected(&'a SecretRef),
}

/// Caches Weixin credentials, refreshing each one at most once at a time
///
/// Clones share the same store, refresh slots and provider. Construct one
/// per platform at start-up and hand clones to whatever needs credentials.
///
/// Fetching an authorizer access token first obtains the component access
/// token through the cache, and fetching a JS-API ticket first obtains the
/// authorizer access token, so a caller only ever asks for what it needs.
pub struct CredentialCache<P, C = System> {
    inner: Arc<Inner<P, C>>,
}

struct Inner<P, C> {
    provider: P,
    refresher: SingleFlight<C>,
    namespace: String,
}

impl<P> CredentialCache<P, System> {
    /// Constructs a cache over `backend` using the system clock
    pub fn new(provider: P, backend: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        Self::with_clock(provider, backend, config, System)
    }
}

impl<P, C> CredentialCache<P, C> {
    /// Constructs a cache over `backend` using a custom clock
    ///
    /// Useful for testing purposes
    pub fn with_clock(
        provider: P,
        backend: Arc<dyn KeyValueStore>,
        config: CacheConfig,
        clock: C,
    ) -> Self {
        let store =
            ExpiringSecretStore::new(backend, config.safety_margin()).with_clock(clock);
        let refresher =
            SingleFlight::new(store, config.fetch_timeout(), config.backoff().clone());

        Self {
            inner: Arc::new(Inner {
                provider,
                refresher,
                namespace: config.namespace().to_owned(),
            }),
        }
    }

    /// The provider credentials are fetched from
    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    /// The store key holding `kind`
    pub fn store_key(&self, kind: &CredentialKind) -> String {
        kind.store_key(&self.inner.namespace)
    }

    fn store(&self) -> &ExpiringSecretStore<C> {
        self.inner.refresher.store()
    }
}

impl<P, C> CredentialCache<P, C>
where
    P: CredentialProvider,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Returns a fresh value for `kind`, fetching one if needed
    pub async fn get(&self, kind: &CredentialKind) -> Result<Secret, CredentialError> {
        self.resolve(kind, Resolve::IfNeeded)
            .await
            .map(Refreshed::into_secret)
    }

    /// Fetches a new value for `kind`, even if the stored one is fresh
    pub async fn force_refresh(&self, kind: &CredentialKind) -> Result<Secret, CredentialError> {
        self.resolve(kind, Resolve::Force)
            .await
            .map(Refreshed::into_secret)
    }

    /// Replaces `rejected`, unless a concurrent caller already has
    pub async fn refresh_rejected(
        &self,
        kind: &CredentialKind,
        rejected: &SecretRef,
    ) -> Result<Secret, CredentialError> {
        self.resolve(kind, Resolve::Rejected(rejected))
            .await
            .map(Refreshed::into_secret)
    }

    /// Marks the stored value for `kind` as expired
    ///
    /// The value is kept so that it can still be served if the next refresh
    /// fails while other callers wait on it.
    pub async fn invalidate(&self, kind: &CredentialKind) -> Result<(), CredentialError> {
        self.store().invalidate(&self.store_key(kind)).await?;
        Ok(())
    }

    /// Reports whether a value for `kind` is stored and fresh
    pub async fn state(&self, kind: &CredentialKind) -> Result<CredentialState, StoreError> {
        let now = self.store().clock().now();
        Ok(match self.store().get(&self.store_key(kind)).await? {
            None => CredentialState::Absent,
            Some(record) if record.is_expired_at(now) => CredentialState::Stale,
            Some(_) => CredentialState::Fresh,
        })
    }

    /// Returns a fresh component access token
    pub async fn get_component_access_token(&self) -> Result<Secret, CredentialError> {
        self.get(&CredentialKind::ComponentAccessToken).await
    }

    /// Fetches a new component access token
    pub async fn force_refresh_component_access_token(&self) -> Result<Secret, CredentialError> {
        self.force_refresh(&CredentialKind::ComponentAccessToken)
            .await
    }

    /// Returns a fresh access token for the authorized account `appid`
    pub async fn get_authorizer_access_token(
        &self,
        appid: &AppIdRef,
    ) -> Result<Secret, CredentialError> {
        self.get(&CredentialKind::authorizer(appid.to_owned())).await
    }

    /// Fetches a new access token for the authorized account `appid`
    pub async fn force_refresh_authorizer_access_token(
        &self,
        appid: &AppIdRef,
    ) -> Result<Secret, CredentialError> {
        self.force_refresh(&CredentialKind::authorizer(appid.to_owned()))
            .await
    }

    /// Returns a fresh JS-API ticket for the authorized account `appid`
    pub async fn get_js_api_ticket(&self, appid: &AppIdRef) -> Result<Secret, CredentialError> {
        self.get(&CredentialKind::js_api_ticket(appid.to_owned())).await
    }

    /// Fetches a new JS-API ticket for the authorized account `appid`
    pub async fn force_refresh_js_api_ticket(
        &self,
        appid: &AppIdRef,
    ) -> Result<Secret, CredentialError> {
        self.force_refresh(&CredentialKind::js_api_ticket(appid.to_owned()))
            .await
    }

    /// Runs `op` with the credential for `kind`
    ///
    /// If `op` reports that the credential was rejected, it is replaced and
    /// `op` is run once more with the replacement.
    pub async fn with_credential<T, E, F, Fut>(
        &self,
        kind: &CredentialKind,
        mut op: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut(Secret) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RejectsCredential,
    {
        let secret = self.get(kind).await?;
        match op(secret.clone()).await {
            Err(error) if error.rejects_credential() => {
                tracing::warn!(%kind, "credential was rejected, replacing it");
                let replacement = self.refresh_rejected(kind, &secret).await?;
                op(replacement).await.map_err(CallError::Call)
            }
            result => result.map_err(CallError::Call),
        }
    }

    /// Stores the verify ticket most recently pushed by Weixin
    pub async fn update_component_verify_ticket(
        &self,
        ticket: &VerifyTicketRef,
    ) -> Result<(), CredentialError> {
        self.store()
            .set_plain(&verify_ticket_key(&self.inner.namespace), ticket.as_str())
            .await?;
        tracing::debug!("stored component verify ticket");
        Ok(())
    }

    /// The verify ticket most recently pushed by Weixin
    pub async fn component_verify_ticket(&self) -> Result<Option<VerifyTicket>, CredentialError> {
        Ok(self
            .store()
            .get_plain(&verify_ticket_key(&self.inner.namespace))
            .await?
            .map(VerifyTicket::new))
    }

    /// The refresh token for the authorized account `appid`
    pub async fn authorizer_refresh_token(
        &self,
        appid: &AppIdRef,
    ) -> Result<Option<RefreshToken>, CredentialError> {
        Ok(self
            .store()
            .get_plain(&refresh_token_key(&self.inner.namespace, appid))
            .await?
            .map(RefreshToken::new))
    }

    /// Stores the credentials obtained when an account authorizes the platform
    pub async fn record_authorization(
        &self,
        grant: &AuthorizationGrant,
    ) -> Result<(), CredentialError> {
        let appid = &grant.authorizer_appid;
        self.store()
            .set_plain(
                &refresh_token_key(&self.inner.namespace, appid),
                grant.refresh_token.as_str(),
            )
            .await?;
        self.store()
            .set(
                &self.store_key(&CredentialKind::authorizer(appid.clone())),
                &grant.access_token,
                grant.lifetime,
            )
            .await?;

        tracing::info!(authorizer_appid = %appid, "recorded authorization");
        Ok(())
    }

    /// Creates a pre-authorization code for the authorization page
    ///
    /// Each code is good for a single visit, so codes are never cached.
    pub async fn pre_auth_code(&self) -> Result<PreAuthCode, CallError<FetchError>> {
        let provider = &self.inner.provider;
        self.with_credential(&CredentialKind::ComponentAccessToken, |token| async move {
            provider.pre_auth_code(&token).await
        })
        .await
    }

    /// Exchanges an authorization code and records the resulting credentials
    ///
    /// Returns the appid of the account that authorized the platform.
    pub async fn authorize(&self, auth_code: &AuthCodeRef) -> Result<AppId, CallError<FetchError>> {
        let provider = &self.inner.provider;
        let grant = self
            .with_credential(&CredentialKind::ComponentAccessToken, |token| async move {
                provider.query_auth(&token, auth_code).await
            })
            .await?;

        self.record_authorization(&grant).await?;
        Ok(grant.authorizer_appid)
    }

    /// Signs `url` for a JS-SDK page of the authorized account `appid`
    pub async fn js_api_signature(
        &self,
        appid: &AppIdRef,
        url: &str,
    ) -> Result<JsApiSignature, CredentialError> {
        let ticket = self.get_js_api_ticket(appid).await?;
        Ok(JsApiSignature::generate(
            appid.to_owned(),
            &ticket,
            url,
            self.store().clock().now(),
        ))
    }

    async fn resolve(
        &self,
        kind: &CredentialKind,
        mode: Resolve<'_>,
    ) -> Result<Refreshed, CredentialError> {
        let key = self.store_key(kind);
        let cache = self.clone();
        let target = kind.clone();
        let fetch = move || cache.fetch(target.clone());

        let refreshed = match mode {
            Resolve::IfNeeded => self.inner.refresher.refresh_if_needed(&key, fetch).await?,
            Resolve::Force => self.inner.refresher.force_refresh(&key, fetch).await?,
            Resolve::Rejected(rejected) => {
                self.inner
                    .refresher
                    .refresh_rejected(&key, rejected, fetch)
                    .await?
            }
        };

        if let Some(error) = refreshed.persist_error() {
            tracing::warn!(
                %kind,
                error = (error as &dyn error::Error),
                "serving a credential that other callers will not see"
            );
        }

        Ok(refreshed)
    }

    fn fetch(&self, kind: CredentialKind) -> FetchFuture {
        let cache = self.clone();
        Box::pin(async move { cache.fetch_credential(&kind).await })
    }

    async fn fetch_credential(&self, kind: &CredentialKind) -> Result<FetchedCredential, FetchError> {
        let provider = &self.inner.provider;

        match kind {
            CredentialKind::ComponentAccessToken => {
                let ticket = self
                    .component_verify_ticket()
                    .await
                    .map_err(prerequisite)?
                    .ok_or(FetchError::MissingInput("component verify ticket"))?;

                provider.component_access_token(&ticket).await
            }
            CredentialKind::AuthorizerAccessToken { appid } => {
                let refresh_token = self
                    .authorizer_refresh_token(appid)
                    .await
                    .map_err(prerequisite)?
                    .ok_or(FetchError::MissingInput("authorizer refresh token"))?;
                let refresh_token = &refresh_token;

                let fetched = self
                    .with_credential(&CredentialKind::ComponentAccessToken, |token| async move {
                        provider
                            .authorizer_access_token(&token, appid, refresh_token)
                            .await
                    })
                    .await
                    .map_err(unwrap_call)?;

                if let Some(rotated) = &fetched.refresh_token {
                    self.store_rotated_refresh_token(appid, rotated).await;
                }

                Ok(fetched)
            }
            CredentialKind::JsApiTicket { appid } => self
                .with_credential(&CredentialKind::authorizer(appid.clone()), |token| async move {
                    provider.js_api_ticket(&token).await
                })
                .await
                .map_err(unwrap_call),
        }
    }

    async fn store_rotated_refresh_token(&self, appid: &AppIdRef, rotated: &RefreshToken) {
        let key = refresh_token_key(&self.inner.namespace, appid);
        match self.store().set_plain(&key, rotated.as_str()).await {
            Ok(()) => tracing::debug!(authorizer_appid = %appid, "stored rotated refresh token"),
            Err(error) => tracing::error!(
                authorizer_appid = %appid,
                error = (&error as &dyn error::Error),
                "unable to store rotated refresh token"
            ),
        }
    }
}

fn prerequisite(error: CredentialError) -> FetchError {
    FetchError::Prerequisite(Box::new(error))
}

fn unwrap_call(error: CallError<FetchError>) -> FetchError {
    match error {
        CallError::Credential(error) => prerequisite(error),
        CallError::Call(error) => error,
    }
}

impl<P, C> Clone for CredentialCache<P, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: fmt::Debug, C: fmt::Debug> fmt::Debug for CredentialCache<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("namespace", &self.inner.namespace)
            .field("provider", &self.inner.provider)
            .field("refresher", &self.inner.refresher)
            .finish()
    }
}
