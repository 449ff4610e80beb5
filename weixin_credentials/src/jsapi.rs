//! JS-SDK page configuration signatures

use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use sha1::{Digest, Sha1};
use weixin_clock::UnixTime;

use crate::{AppId, SecretRef};

const NONCE_LEN: usize = 16;

/// The values a page passes to `wx.config`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsApiSignature {
    /// The appid of the account the page belongs to
    pub app_id: AppId,
    /// The random string mixed into the signature
    pub nonce_str: String,
    /// The signing time, in seconds since the Unix epoch
    pub timestamp: u64,
    /// The signed page URL, without its fragment
    pub url: String,
    /// Hex-encoded SHA-1 signature
    pub signature: String,
}

impl JsApiSignature {
    /// Signs `url` for `app_id` using a fresh nonce
    pub fn generate(app_id: AppId, ticket: &SecretRef, url: &str, timestamp: UnixTime) -> Self {
        let nonce_str: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self::with_nonce(app_id, ticket, url, nonce_str, timestamp)
    }

    /// Signs `url` for `app_id` using the given nonce
    pub fn with_nonce(
        app_id: AppId,
        ticket: &SecretRef,
        url: &str,
        nonce_str: String,
        timestamp: UnixTime,
    ) -> Self {
        let url = strip_fragment(url).to_owned();
        let signature = sign(ticket, &nonce_str, timestamp, &url);
        Self {
            app_id,
            nonce_str,
            timestamp: timestamp.0,
            url,
            signature,
        }
    }
}

/// Computes the JS-SDK signature over the ticket, nonce, timestamp and page URL
pub fn sign(ticket: &SecretRef, nonce_str: &str, timestamp: UnixTime, url: &str) -> String {
    let plain = format!(
        "jsapi_ticket={}&noncestr={}&timestamp={}&url={}",
        ticket.as_str(),
        nonce_str,
        timestamp.0,
        strip_fragment(url)
    );
    hex::encode(Sha1::digest(plain.as_bytes()))
}

fn strip_fragment(url: &str) -> &str {
    url.split('#').next().unwrap_or(url)
}
