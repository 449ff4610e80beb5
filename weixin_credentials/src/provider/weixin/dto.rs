//! Request and response bodies of the Weixin credential endpoints

use serde::{Deserialize, Serialize};
use weixin_clock::DurationSecs;

use crate::{
    AppId, AppIdRef, AppSecretRef, AuthCodeRef, PreAuthCode, RefreshToken, RefreshTokenRef,
    Secret, VerifyTicketRef,
};

/// Every Weixin response is either the expected body or an error body
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum WeixinResponse<T> {
    Ok(T),
    Err(ErrorBody),
}

#[derive(Debug, Deserialize)]
pub(super) struct ErrorBody {
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
}

#[derive(Debug, Serialize)]
pub(super) struct ComponentTokenRequest<'a> {
    pub component_appid: &'a AppIdRef,
    pub component_appsecret: &'a AppSecretRef,
    pub component_verify_ticket: &'a VerifyTicketRef,
}

#[derive(Debug, Deserialize)]
pub(super) struct ComponentTokenResponse {
    pub component_access_token: Secret,
    pub expires_in: DurationSecs,
}

#[derive(Debug, Serialize)]
pub(super) struct AuthorizerTokenRequest<'a> {
    pub component_appid: &'a AppIdRef,
    pub authorizer_appid: &'a AppIdRef,
    pub authorizer_refresh_token: &'a RefreshTokenRef,
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthorizerTokenResponse {
    pub authorizer_access_token: Secret,
    pub expires_in: DurationSecs,
    #[serde(default)]
    pub authorizer_refresh_token: Option<RefreshToken>,
}

#[derive(Debug, Serialize)]
pub(super) struct PreAuthCodeRequest<'a> {
    pub component_appid: &'a AppIdRef,
}

#[derive(Debug, Deserialize)]
pub(super) struct PreAuthCodeResponse {
    pub pre_auth_code: PreAuthCode,
}

#[derive(Debug, Serialize)]
pub(super) struct QueryAuthRequest<'a> {
    pub component_appid: &'a AppIdRef,
    pub authorization_code: &'a AuthCodeRef,
}

#[derive(Debug, Deserialize)]
pub(super) struct QueryAuthResponse {
    pub authorization_info: AuthorizationInfo,
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthorizationInfo {
    pub authorizer_appid: AppId,
    pub authorizer_access_token: Secret,
    pub expires_in: DurationSecs,
    pub authorizer_refresh_token: RefreshToken,
}

/// `getticket` also reports `errcode: 0` on success, which the ticket fields
/// take precedence over
#[derive(Debug, Deserialize)]
pub(super) struct JsApiTicketResponse {
    pub ticket: Secret,
    pub expires_in: DurationSecs,
}
