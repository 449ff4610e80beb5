//! Credential kinds and the store keys they live under

use std::fmt;

use crate::{AppId, AppIdRef};

/// The kinds of credential managed by the cache
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// The platform's own `component_access_token`
    ComponentAccessToken,
    /// The `authorizer_access_token` for an account that authorized the platform
    AuthorizerAccessToken {
        /// The authorizer's appid
        appid: AppId,
    },
    /// The JS-SDK `jsapi_ticket` for an authorized account
    JsApiTicket {
        /// The authorizer's appid
        appid: AppId,
    },
}

impl CredentialKind {
    /// The authorizer access token for `appid`
    pub fn authorizer(appid: impl Into<AppId>) -> Self {
        Self::AuthorizerAccessToken {
            appid: appid.into(),
        }
    }

    /// The JS-API ticket for `appid`
    pub fn js_api_ticket(appid: impl Into<AppId>) -> Self {
        Self::JsApiTicket {
            appid: appid.into(),
        }
    }

    /// The store key holding this credential's record
    pub fn store_key(&self, namespace: &str) -> String {
        match self {
            Self::ComponentAccessToken => format!("{}:component_access_token", namespace),
            Self::AuthorizerAccessToken { appid } => {
                format!("{}:authorizer_access_token:{}", namespace, appid)
            }
            Self::JsApiTicket { appid } => format!("{}:js_api_ticket:{}", namespace, appid),
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ComponentAccessToken => f.write_str("component access token"),
            Self::AuthorizerAccessToken { appid } => {
                write!(f, "authorizer access token ({})", appid)
            }
            Self::JsApiTicket { appid } => write!(f, "js-api ticket ({})", appid),
        }
    }
}

pub(crate) fn verify_ticket_key(namespace: &str) -> String {
    format!("{}:component_verify_ticket", namespace)
}

pub(crate) fn refresh_token_key(namespace: &str, appid: &AppIdRef) -> String {
    format!("{}:authorizer_refresh_token:{}", namespace, appid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_appid() {
        let a = CredentialKind::authorizer(AppId::from_static("wxa"));
        let b = CredentialKind::authorizer(AppId::from_static("wxb"));
        assert_eq!(a.store_key("weixin"), "weixin:authorizer_access_token:wxa");
        assert_ne!(a.store_key("weixin"), b.store_key("weixin"));
        assert_eq!(
            CredentialKind::ComponentAccessToken.store_key("ns"),
            "ns:component_access_token"
        );
        assert_eq!(
            CredentialKind::js_api_ticket(AppId::from_static("wxa")).store_key("ns"),
            "ns:js_api_ticket:wxa"
        );
    }

    #[test]
    fn ticket_and_token_for_same_app_do_not_collide() {
        let appid = AppId::from_static("wxa");
        assert_ne!(
            CredentialKind::authorizer(appid.clone()).store_key("ns"),
            CredentialKind::js_api_ticket(appid).store_key("ns")
        );
    }
}
