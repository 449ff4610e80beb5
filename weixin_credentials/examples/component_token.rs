use std::{sync::Arc, time::Duration};

use clap::Parser;
use tokio::time;
use weixin_credentials::{
    store::InMemoryStore, AppId, CacheConfig, ComponentCredentials, CredentialCache,
    CredentialKind, CredentialState, VerifyTicket, WeixinClient,
};

#[derive(Debug, Parser)]
struct Opts {
    /// The third-party platform's appid
    #[arg(short = 'a', long, env)]
    component_appid: String,

    /// The third-party platform's app secret
    #[arg(short = 's', long, env, hide_env_values = true)]
    component_appsecret: String,

    /// The most recent verify ticket pushed by Weixin
    #[arg(short = 't', long, env, hide_env_values = true)]
    component_verify_ticket: VerifyTicket,

    /// An authorized account to also keep a JS-API ticket for
    #[arg(long, env)]
    authorizer_appid: Option<AppId>,

    /// The API host to send requests to
    #[arg(long, env, default_value = WeixinClient::DEFAULT_BASE_URL)]
    base_url: String,

    /// Seconds between reads of the cache
    #[arg(long, env, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().build()?;
    let credentials = ComponentCredentials::new(opts.component_appid, opts.component_appsecret)?;
    let provider = WeixinClient::new(client, credentials).with_base_url(&opts.base_url)?;

    let cache = CredentialCache::new(
        provider,
        Arc::new(InMemoryStore::new()),
        CacheConfig::default(),
    );
    cache
        .update_component_verify_ticket(&opts.component_verify_ticket)
        .await?;

    let mut kinds = vec![CredentialKind::ComponentAccessToken];
    if let Some(appid) = opts.authorizer_appid {
        kinds.push(CredentialKind::js_api_ticket(appid));
    }

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        for kind in &kinds {
            let state = cache.state(kind).await?;
            match cache.get(kind).await {
                Ok(secret) => match state {
                    CredentialState::Fresh => tracing::debug!(
                        %kind,
                        ?state,
                        secret = format_args!("{:#?}", secret),
                        "pulled credential"
                    ),
                    CredentialState::Absent | CredentialState::Stale => tracing::info!(
                        %kind,
                        ?state,
                        secret = format_args!("{:#?}", secret),
                        "pulled credential"
                    ),
                },
                Err(error) => tracing::error!(
                    %kind,
                    ?state,
                    error = (&error as &dyn std::error::Error),
                    transient = error.is_transient(),
                    "unable to obtain credential"
                ),
            }
        }
    }
}
