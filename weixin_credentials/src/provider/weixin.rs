//! A credential provider backed by the Weixin open platform API

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;

use super::{AuthorizationGrant, CredentialProvider, FetchedCredential};
use crate::{
    config::ComponentCredentials,
    error::{ConfigError, FetchError},
    AppIdRef, AuthCodeRef, PreAuthCode, PreAuthCodeRef, RefreshTokenRef, SecretRef,
    VerifyTicketRef,
};

mod dto;

const COMPONENT_TOKEN_PATH: &str = "/cgi-bin/component/api_component_token";
const AUTHORIZER_TOKEN_PATH: &str = "/cgi-bin/component/api_authorizer_token";
const QUERY_AUTH_PATH: &str = "/cgi-bin/component/api_query_auth";
const PRE_AUTH_CODE_PATH: &str = "/cgi-bin/component/api_create_preauthcode";
const JS_API_TICKET_PATH: &str = "/cgi-bin/ticket/getticket";

/// Requests credentials from the Weixin open platform on behalf of a third-party platform
#[derive(Clone, Debug)]
pub struct WeixinClient {
    client: reqwest::Client,
    base_url: String,
    credentials: ComponentCredentials,
}

impl WeixinClient {
    /// The production API host
    pub const DEFAULT_BASE_URL: &'static str = "https://api.weixin.qq.com";

    /// The authorization page shown to account administrators
    pub const LOGIN_PAGE_URL: &'static str = "https://mp.weixin.qq.com/cgi-bin/componentloginpage";

    /// Constructs a client for the production API
    pub fn new(client: reqwest::Client, credentials: ComponentCredentials) -> Self {
        Self {
            client,
            base_url: Self::DEFAULT_BASE_URL.to_owned(),
            credentials,
        }
    }

    /// Points the client at another API host, such as a proxy or a test server
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ConfigError::Empty { field: "base_url" });
        }
        Url::parse(base_url)?;
        self.base_url = base_url.to_owned();
        Ok(self)
    }

    /// The platform identity used for requests
    pub fn credentials(&self) -> &ComponentCredentials {
        &self.credentials
    }

    /// The page an account administrator visits to authorize the platform
    ///
    /// Weixin redirects the administrator to `redirect_uri` with an
    /// `auth_code` once the platform has been authorized.
    pub fn login_page_url(&self, pre_auth_code: &PreAuthCodeRef, redirect_uri: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("component_appid", self.credentials.component_appid().as_str())
            .append_pair("pre_auth_code", pre_auth_code.as_str())
            .append_pair("redirect_uri", redirect_uri)
            .finish();
        format!("{}?{}", Self::LOGIN_PAGE_URL, query)
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, FetchError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|error| FetchError::Transport(Box::new(error)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &'static str,
    ) -> Result<T, FetchError> {
        tracing::trace!(path, "requesting credential from weixin");

        let resp = request.send().await.map_err(transport)?;

        let status = resp.status();
        tracing::debug!(
            path,
            response.status = status.as_u16(),
            "received response from weixin"
        );

        let body = resp.bytes().await.map_err(transport)?;

        if !status.is_success() {
            return Err(FetchError::Transport(
                format!("unexpected response status {}", status).into(),
            ));
        }

        match serde_json::from_slice(&body)? {
            dto::WeixinResponse::Ok(value) => Ok(value),
            dto::WeixinResponse::Err(error) => {
                tracing::debug!(path, errcode = error.errcode, errmsg = %error.errmsg, "weixin returned an error");
                Err(FetchError::Weixin {
                    code: error.errcode,
                    message: error.errmsg,
                })
            }
        }
    }
}

/// Request URLs carry access tokens in their query, so they are dropped
/// before the error can reach a log
fn transport(error: reqwest::Error) -> FetchError {
    FetchError::Transport(Box::new(error.without_url()))
}

#[async_trait]
impl CredentialProvider for WeixinClient {
    #[tracing::instrument(
        err,
        skip(self, verify_ticket),
        fields(component_appid = %self.credentials.component_appid()),
    )]
    async fn component_access_token(
        &self,
        verify_ticket: &VerifyTicketRef,
    ) -> Result<FetchedCredential, FetchError> {
        let body = dto::ComponentTokenRequest {
            component_appid: self.credentials.component_appid(),
            component_appsecret: self.credentials.component_appsecret(),
            component_verify_ticket: verify_ticket,
        };

        let url = self.endpoint(COMPONENT_TOKEN_PATH, &[])?;
        let resp: dto::ComponentTokenResponse = self
            .send(self.client.post(url).json(&body), COMPONENT_TOKEN_PATH)
            .await?;

        Ok(FetchedCredential::new(
            resp.component_access_token,
            resp.expires_in,
        ))
    }

    #[tracing::instrument(
        err,
        skip(self, component_access_token, refresh_token),
        fields(component_appid = %self.credentials.component_appid()),
    )]
    async fn authorizer_access_token(
        &self,
        component_access_token: &SecretRef,
        authorizer_appid: &AppIdRef,
        refresh_token: &RefreshTokenRef,
    ) -> Result<FetchedCredential, FetchError> {
        let body = dto::AuthorizerTokenRequest {
            component_appid: self.credentials.component_appid(),
            authorizer_appid,
            authorizer_refresh_token: refresh_token,
        };

        let url = self.endpoint(
            AUTHORIZER_TOKEN_PATH,
            &[("component_access_token", component_access_token.as_str())],
        )?;
        let resp: dto::AuthorizerTokenResponse = self
            .send(self.client.post(url).json(&body), AUTHORIZER_TOKEN_PATH)
            .await?;

        let fetched = FetchedCredential::new(resp.authorizer_access_token, resp.expires_in);
        Ok(match resp.authorizer_refresh_token {
            Some(rotated) => fetched.with_refresh_token(rotated),
            None => fetched,
        })
    }

    #[tracing::instrument(
        err,
        skip(self, component_access_token),
        fields(component_appid = %self.credentials.component_appid()),
    )]
    async fn pre_auth_code(
        &self,
        component_access_token: &SecretRef,
    ) -> Result<PreAuthCode, FetchError> {
        let body = dto::PreAuthCodeRequest {
            component_appid: self.credentials.component_appid(),
        };

        let url = self.endpoint(
            PRE_AUTH_CODE_PATH,
            &[("component_access_token", component_access_token.as_str())],
        )?;
        let resp: dto::PreAuthCodeResponse = self
            .send(self.client.post(url).json(&body), PRE_AUTH_CODE_PATH)
            .await?;

        Ok(resp.pre_auth_code)
    }

    #[tracing::instrument(err, skip(self, authorizer_access_token))]
    async fn js_api_ticket(
        &self,
        authorizer_access_token: &SecretRef,
    ) -> Result<FetchedCredential, FetchError> {
        let url = self.endpoint(
            JS_API_TICKET_PATH,
            &[
                ("access_token", authorizer_access_token.as_str()),
                ("type", "jsapi"),
            ],
        )?;
        let resp: dto::JsApiTicketResponse =
            self.send(self.client.get(url), JS_API_TICKET_PATH).await?;

        Ok(FetchedCredential::new(resp.ticket, resp.expires_in))
    }

    #[tracing::instrument(
        err,
        skip(self, component_access_token, auth_code),
        fields(component_appid = %self.credentials.component_appid()),
    )]
    async fn query_auth(
        &self,
        component_access_token: &SecretRef,
        auth_code: &AuthCodeRef,
    ) -> Result<AuthorizationGrant, FetchError> {
        let body = dto::QueryAuthRequest {
            component_appid: self.credentials.component_appid(),
            authorization_code: auth_code,
        };

        let url = self.endpoint(
            QUERY_AUTH_PATH,
            &[("component_access_token", component_access_token.as_str())],
        )?;
        let resp: dto::QueryAuthResponse = self
            .send(self.client.post(url).json(&body), QUERY_AUTH_PATH)
            .await?;

        let info = resp.authorization_info;
        tracing::info!(authorizer_appid = %info.authorizer_appid, "account authorized the platform");

        Ok(AuthorizationGrant {
            authorizer_appid: info.authorizer_appid,
            access_token: info.authorizer_access_token,
            lifetime: info.expires_in,
            refresh_token: info.authorizer_refresh_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> WeixinClient {
        let credentials = ComponentCredentials::new("wx-component", "component-secret").unwrap();
        WeixinClient::new(reqwest::Client::new(), credentials)
    }

    #[test]
    fn endpoints_carry_query_parameters() {
        let url = client()
            .endpoint(JS_API_TICKET_PATH, &[("access_token", "a b"), ("type", "jsapi")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.weixin.qq.com/cgi-bin/ticket/getticket?access_token=a+b&type=jsapi"
        );
    }

    #[test]
    fn endpoints_without_parameters_have_no_query() {
        let url = client().endpoint(COMPONENT_TOKEN_PATH, &[]).unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn login_page_escapes_the_redirect() {
        let url = client().login_page_url(
            PreAuthCodeRef::from_str("preauth@@@1"),
            "https://platform.example/authorized?from=weixin",
        );
        assert_eq!(
            url,
            "https://mp.weixin.qq.com/cgi-bin/componentloginpage?component_appid=wx-component\
             &pre_auth_code=preauth%40%40%401\
             &redirect_uri=https%3A%2F%2Fplatform.example%2Fauthorized%3Ffrom%3Dweixin"
        );
    }

    #[test]
    fn base_url_is_validated() {
        let local = client().with_base_url("http://127.0.0.1:8080/").unwrap();
        assert_eq!(
            local.endpoint(COMPONENT_TOKEN_PATH, &[]).unwrap().as_str(),
            "http://127.0.0.1:8080/cgi-bin/component/api_component_token"
        );

        assert!(matches!(
            client().with_base_url("not a url"),
            Err(ConfigError::InvalidUrl(_))
        ));
        assert!(matches!(
            client().with_base_url(" "),
            Err(ConfigError::Empty { field: "base_url" })
        ));
    }
}
