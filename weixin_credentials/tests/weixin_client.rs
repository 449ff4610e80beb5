#![cfg(feature = "weixin")]

use std::{collections::HashMap, error::Error, sync::Arc};

use axum::{
    extract::Query,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use weixin_clock::{DurationSecs, TestClock, UnixTime};
use weixin_credentials::{
    store::InMemoryStore, AppIdRef, AuthCodeRef, CacheConfig, ComponentCredentials,
    CredentialCache, CredentialProvider, FetchError, PreAuthCodeRef, RefreshTokenRef,
    RejectsCredential, SecretRef, VerifyTicketRef, WeixinClient,
};

const COMPONENT_APPID: &str = "wx-component";
const COMPONENT_SECRET: &str = "component-secret";
const AUTHORIZER: &str = "wx-authorizer";

fn weixin_error(code: i64, message: &str) -> Json<Value> {
    Json(json!({ "errcode": code, "errmsg": message }))
}

async fn component_token(Json(body): Json<Value>) -> Json<Value> {
    if body["component_appid"] != COMPONENT_APPID || body["component_appsecret"] != COMPONENT_SECRET
    {
        return weixin_error(41002, "appid missing");
    }
    match body["component_verify_ticket"].as_str() {
        Some(ticket) => Json(json!({
            "component_access_token": format!("ctok-{}", ticket),
            "expires_in": 7200,
        })),
        None => weixin_error(61006, "component ticket is invalid"),
    }
}

async fn authorizer_token(
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let component = query.get("component_access_token").cloned().unwrap_or_default();
    if !component.starts_with("ctok-") {
        return weixin_error(40001, "invalid credential");
    }
    if body["component_appid"] != COMPONENT_APPID || body["authorizer_appid"] != AUTHORIZER {
        return weixin_error(61003, "component is not authorized by this account");
    }
    Json(json!({
        "authorizer_access_token": format!(
            "atok-{}-{}",
            component,
            body["authorizer_refresh_token"].as_str().unwrap_or_default()
        ),
        "expires_in": 7200,
        "authorizer_refresh_token": "refresh-rotated",
    }))
}

async fn query_auth(
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    if !query.contains_key("component_access_token") {
        return weixin_error(40001, "invalid credential");
    }
    match body["authorization_code"].as_str() {
        Some("good-code") => Json(json!({
            "authorization_info": {
                "authorizer_appid": AUTHORIZER,
                "authorizer_access_token": "atok-granted",
                "expires_in": 7200,
                "authorizer_refresh_token": "refresh-granted",
                "func_info": [ { "funcscope_category": { "id": 1 } } ],
            }
        })),
        _ => weixin_error(61010, "code is expired"),
    }
}

async fn pre_auth_code(
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    match query.get("component_access_token") {
        Some(token) if token.starts_with("ctok-") && body["component_appid"] == COMPONENT_APPID => {
            Json(json!({
                "pre_auth_code": format!("preauth-{}", token),
                "expires_in": 1800,
            }))
        }
        _ => weixin_error(40001, "invalid credential"),
    }
}

async fn js_api_ticket(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    match (query.get("access_token"), query.get("type").map(String::as_str)) {
        (Some(token), Some("jsapi")) if token.starts_with("atok-") => Json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "ticket": format!("ticket-for-{}", token),
            "expires_in": 7200,
        })),
        (Some(_), Some("jsapi")) => weixin_error(42001, "access_token expired"),
        _ => weixin_error(40097, "invalid args"),
    }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn mock_weixin() -> String {
    let app = Router::new()
        .route("/cgi-bin/component/api_component_token", post(component_token))
        .route("/cgi-bin/component/api_authorizer_token", post(authorizer_token))
        .route("/cgi-bin/component/api_query_auth", post(query_auth))
        .route("/cgi-bin/component/api_create_preauthcode", post(pre_auth_code))
        .route("/cgi-bin/ticket/getticket", get(js_api_ticket));
    serve(app).await
}

fn client(base_url: &str) -> WeixinClient {
    let credentials = ComponentCredentials::new(COMPONENT_APPID, COMPONENT_SECRET).unwrap();
    WeixinClient::new(reqwest::Client::new(), credentials)
        .with_base_url(base_url)
        .unwrap()
}

#[tokio::test]
async fn requests_component_access_token() {
    let client = client(&mock_weixin().await);

    let fetched = client
        .component_access_token(VerifyTicketRef::from_str("ticket@@@1"))
        .await
        .unwrap();

    assert_eq!(fetched.value.as_str(), "ctok-ticket@@@1");
    assert_eq!(fetched.lifetime, DurationSecs(7_200));
    assert!(fetched.refresh_token.is_none());
}

#[tokio::test]
async fn requests_authorizer_access_token_with_rotated_refresh_token() {
    let client = client(&mock_weixin().await);

    let fetched = client
        .authorizer_access_token(
            SecretRef::from_str("ctok-1"),
            AppIdRef::from_str(AUTHORIZER),
            RefreshTokenRef::from_str("refresh-0"),
        )
        .await
        .unwrap();

    assert_eq!(fetched.value.as_str(), "atok-ctok-1-refresh-0");
    assert_eq!(
        fetched.refresh_token.as_ref().map(|t| t.as_str()),
        Some("refresh-rotated")
    );
}

#[tokio::test]
async fn requests_js_api_ticket() {
    let client = client(&mock_weixin().await);

    let fetched = client
        .js_api_ticket(SecretRef::from_str("atok-1"))
        .await
        .unwrap();

    assert_eq!(fetched.value.as_str(), "ticket-for-atok-1");
    assert_eq!(fetched.lifetime, DurationSecs(7_200));
}

#[tokio::test]
async fn exchanges_authorization_code() {
    let client = client(&mock_weixin().await);

    let grant = client
        .query_auth(
            SecretRef::from_str("ctok-1"),
            AuthCodeRef::from_str("good-code"),
        )
        .await
        .unwrap();

    assert_eq!(grant.authorizer_appid.as_str(), AUTHORIZER);
    assert_eq!(grant.access_token.as_str(), "atok-granted");
    assert_eq!(grant.refresh_token.as_str(), "refresh-granted");
}

#[tokio::test]
async fn creates_pre_auth_code() {
    let client = client(&mock_weixin().await);

    let code = client
        .pre_auth_code(SecretRef::from_str("ctok-1"))
        .await
        .unwrap();
    assert_eq!(code.as_str(), "preauth-ctok-1");

    let err = client
        .pre_auth_code(SecretRef::from_str("stale"))
        .await
        .unwrap_err();
    assert!(err.rejects_credential());
}

#[tokio::test]
async fn transport_errors_do_not_reveal_tokens() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let client = client(&format!("http://{}", addr));

    let err = client
        .js_api_ticket(SecretRef::from_str("TOP_SECRET_TOKEN"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)));

    let mut chain = Vec::new();
    let mut current: Option<&(dyn Error + 'static)> = Some(&err);
    while let Some(error) = current {
        chain.push(error.to_string());
        current = error.source();
    }
    let chain = chain.join(" | ");
    assert!(!chain.contains("TOP_SECRET_TOKEN"), "{}", chain);
    assert!(!format!("{:?}", err).contains("TOP_SECRET_TOKEN"));
}

#[tokio::test]
async fn error_bodies_become_weixin_errors() {
    let client = client(&mock_weixin().await);

    let err = client
        .js_api_ticket(SecretRef::from_str("stale"))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Weixin { code: 42001, .. }));
    assert!(err.rejects_credential());
    assert!(!err.is_transient());
}

#[tokio::test]
async fn server_errors_are_transient() {
    let app = Router::new().route(
        "/cgi-bin/component/api_component_token",
        post(|| async { (StatusCode::BAD_GATEWAY, "upstream unavailable") }),
    );
    let client = client(&serve(app).await);

    let err = client
        .component_access_token(VerifyTicketRef::from_str("ticket@@@1"))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Transport(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn unexpected_bodies_are_decode_errors() {
    let app = Router::new().route(
        "/cgi-bin/component/api_component_token",
        post(|| async { Json(json!({ "unexpected": true })) }),
    );
    let client = client(&serve(app).await);

    let err = client
        .component_access_token(VerifyTicketRef::from_str("ticket@@@1"))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Decode(_)));
}

#[tokio::test]
async fn cache_chains_credentials_through_the_api() {
    let clock = TestClock::new(UnixTime(1_000));
    let cache = CredentialCache::with_clock(
        client(&mock_weixin().await),
        Arc::new(InMemoryStore::new()),
        CacheConfig::default(),
        clock.clone(),
    );
    cache
        .update_component_verify_ticket(VerifyTicketRef::from_str("ticket@@@1"))
        .await
        .unwrap();

    let appid = cache
        .authorize(AuthCodeRef::from_str("good-code"))
        .await
        .unwrap();
    assert_eq!(appid.as_str(), AUTHORIZER);

    let ticket = cache.get_js_api_ticket(&appid).await.unwrap();
    assert_eq!(ticket.as_str(), "ticket-for-atok-granted");

    clock.inc(7_200);
    let token = cache.get_authorizer_access_token(&appid).await.unwrap();
    assert_eq!(token.as_str(), "atok-ctok-ticket@@@1-refresh-granted");
    assert_eq!(
        cache
            .authorizer_refresh_token(&appid)
            .await
            .unwrap()
            .unwrap()
            .as_str(),
        "refresh-rotated"
    );
}

#[tokio::test]
async fn cache_builds_the_authorization_page() {
    let client = client(&mock_weixin().await);
    let cache = CredentialCache::new(
        client.clone(),
        Arc::new(InMemoryStore::new()),
        CacheConfig::default(),
    );
    cache
        .update_component_verify_ticket(VerifyTicketRef::from_str("ticket@@@1"))
        .await
        .unwrap();

    let code = cache.pre_auth_code().await.unwrap();
    assert_eq!(code.as_str(), "preauth-ctok-ticket@@@1");

    let page = client.login_page_url(&code, "https://platform.example/authorized");
    assert!(page.starts_with(WeixinClient::LOGIN_PAGE_URL));
    assert!(page.contains("component_appid=wx-component"));
    assert!(page.contains("pre_auth_code=preauth-ctok-ticket%40%40%401"));
    assert!(page.contains("redirect_uri=https%3A%2F%2Fplatform.example%2Fauthorized"));

    let login = client.login_page_url(PreAuthCodeRef::from_str("preauth-x"), "/cb");
    assert!(login.ends_with("pre_auth_code=preauth-x&redirect_uri=%2Fcb"));
}
