mod api;
mod auth;
mod calls;
mod codec;
mod config;
mod engine;
mod error;
mod friends;
mod hub;
mod rate_limit;
mod session;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wirechat_store::Database;

use crate::api::AppState;
use crate::auth::{AuthService, JwtConfig};
use crate::calls::CallService;
use crate::config::ServerConfig;
use crate::engine::{CallEngine, LiveKitEngine};
use crate::friends::FriendService;
use crate::hub::Hub;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wirechat_server=debug")),
        )
        .init();

    info!("starting wirechat server v{}", env!("CARGO_PKG_VERSION"));

    let (config_path, overrides) = parse_args()?;
    let mut config = ServerConfig::load(config_path.as_deref());
    for (key, value) in overrides {
        if let Err(e) = config.apply_key(&key, &value) {
            anyhow::bail!("invalid flag --{key}={value}: {e}");
        }
    }

    info!(
        addr = %config.addr,
        db_path = %config.database_path.display(),
        read_header_timeout = ?config.read_header_timeout,
        shutdown_timeout = ?config.shutdown_timeout,
        max_message_bytes = config.max_message_bytes,
        ping_interval = ?config.ping_interval,
        client_idle_timeout = ?config.client_idle_timeout,
        jwt_required = config.jwt_required,
        "loaded configuration"
    );

    let db = Arc::new(Database::open(&config.database_path)?);
    info!(db_path = %config.database_path.display(), "database initialized");

    let jwt = JwtConfig {
        secret: config.jwt_secret.clone(),
        issuer: config.jwt_issuer.clone(),
        audience: config.jwt_audience.clone(),
        ttl: chrono::Duration::hours(24),
    };
    let auth = Arc::new(AuthService::new(db.clone(), jwt));
    let friends = Arc::new(FriendService::new(db.clone()));

    let engine: Option<Arc<dyn CallEngine>> = if config.livekit.enabled {
        if config.livekit.api_key.is_empty() || config.livekit.api_secret.is_empty() {
            anyhow::bail!("livekit is enabled but api_key or api_secret is not set");
        }
        info!(ws_url = %config.livekit.ws_url, "livekit integration enabled");
        Some(Arc::new(LiveKitEngine::new(
            config.livekit.api_key.clone(),
            config.livekit.api_secret.clone(),
            config.livekit.ws_url.clone(),
        )))
    } else {
        info!("livekit integration disabled");
        None
    };

    let calls_enabled = engine.is_some();
    let calls = Arc::new(CallService::new(db.clone(), engine, friends.clone()));

    let shutdown = CancellationToken::new();
    let (hub, hub_handle) = Hub::new(
        Some(db.clone()),
        calls_enabled.then(|| calls.clone()),
    );
    tokio::spawn(hub.run(shutdown.clone()));

    let rate_limiter = RateLimiter::default();
    // Evict rate-limit buckets idle for more than ten minutes.
    let limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.purge_stale(600.0).await;
        }
    });

    let state = AppState {
        db,
        auth,
        friends,
        calls,
        hub: hub_handle,
        config: Arc::new(config.clone()),
        rate_limiter,
        shutdown: shutdown.clone(),
    };

    let mut server = tokio::spawn(api::serve(state, config.addr, shutdown.clone()));

    tokio::select! {
        result = &mut server => {
            shutdown.cancel();
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            shutdown.cancel();
            // Give graceful shutdown a bounded window to drain connections.
            match tokio::time::timeout(config.shutdown_timeout, &mut server).await {
                Ok(result) => result??,
                Err(_) => tracing::warn!("graceful shutdown timed out"),
            }
        }
    }

    info!("server stopped");
    Ok(())
}

/// Minimal flag parsing: `--config <path>` plus `--<key> <value>` /
/// `--<key>=<value>` for every configuration key.
fn parse_args() -> anyhow::Result<(Option<PathBuf>, Vec<(String, String)>)> {
    let mut config_path = None;
    let mut overrides = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            anyhow::bail!("unexpected argument: {arg}");
        };

        let (key, value) = match flag.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("flag --{flag} requires a value"))?;
                (flag.to_string(), value)
            }
        };

        if key == "config" {
            config_path = Some(PathBuf::from(value));
        } else {
            overrides.push((key.replace('-', "_"), value));
        }
    }

    Ok((config_path, overrides))
}
