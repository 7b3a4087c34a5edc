use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llmux::cli::{Cli, Commands, KeyCommands};
use llmux::config::Config;
use llmux::credentials;
use llmux::duration::{parse_duration, BudgetDuration};
use llmux::jobs::cleanup::start_bucket_sweeper;
use llmux::jobs::reconcile::ReconcileScheduler;
use llmux::middleware::rate_limit::RedisLimiter;
use llmux::models::{ApiKey, KeyType};
use llmux::store::memory::MemoryStore;
use llmux::store::postgres::PgStore;
use llmux::store::{GatewayStore, KeyFilter};
use llmux::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "llmux=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = llmux::config::load()?;
    let args = Cli::parse();

    match args.command {
        Some(Commands::Serve { port }) => run_server(cfg, port).await,
        Some(Commands::Key { command }) => {
            let state = build_state(&cfg).await?;
            handle_key_command(command, &state).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    }
}

/// Wire the store, limiter, and services into shared state. Postgres when
/// DATABASE_URL is set, in-memory otherwise.
async fn build_state(cfg: &Config) -> anyhow::Result<AppState> {
    let store: Arc<dyn GatewayStore> = match &cfg.database_url {
        Some(url) => {
            let pg = PgStore::connect(url).await.context("connecting to postgres")?;
            pg.migrate().await.context("running migrations")?;
            tracing::info!("using postgres store");
            Arc::new(pg)
        }
        None => {
            tracing::warn!("DATABASE_URL not set — using in-memory store (state is not persisted)");
            Arc::new(MemoryStore::new())
        }
    };

    let mut state = AppState::new(store, cfg.clone());

    if let Some(redis_url) = &cfg.redis_url {
        let client = redis::Client::open(redis_url.as_str())?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        state.distributed_limiter = Some(Arc::new(RedisLimiter::new(conn)));
        tracing::info!("distributed rate limiting enabled");
    }

    Ok(state)
}

async fn run_server(mut cfg: Config, port: u16) -> anyhow::Result<()> {
    cfg.port = port;
    let state = build_state(&cfg).await?;

    // Background workers share one shutdown channel; closing it lets each
    // finish its in-flight sweep and return.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler = Arc::new(ReconcileScheduler::new(
        state.store.clone(),
        state.audit.clone(),
        cfg.credential_prefix.clone(),
        std::time::Duration::from_secs(cfg.reconcile_interval_secs),
    ));
    let reconcile_handle = scheduler.start(shutdown_rx.clone());
    let sweeper_handle = start_bucket_sweeper(state.limiter.clone(), shutdown_rx);

    let app = llmux::api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "llmux gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(reconcile_handle, sweeper_handle);
    tracing::info!("llmux gateway stopped");
    Ok(())
}

async fn handle_key_command(command: KeyCommands, state: &AppState) -> anyhow::Result<()> {
    match command {
        KeyCommands::Generate {
            name,
            alias,
            key_type,
            team_id,
            user_id,
            allowed_models,
            max_budget,
            budget_duration,
            expires_in,
        } => {
            let key_type = KeyType::parse(&key_type)
                .ok_or_else(|| anyhow::anyhow!("invalid key type '{}'", key_type))?;
            let budget_duration = BudgetDuration::parse(&budget_duration)
                .map_err(|e| anyhow::anyhow!(e))?;

            let now = chrono::Utc::now();
            let minted = credentials::mint(&state.config.credential_prefix);
            let mut key = ApiKey::new(
                uuid::Uuid::new_v4().to_string(),
                minted.hash,
                minted.display_prefix,
            );
            key.name = name;
            key.alias = alias;
            key.key_type = key_type;
            key.team_id = team_id;
            key.user_id = user_id;
            key.allowed_models = allowed_models.unwrap_or_default();
            key.max_budget = max_budget;
            key.budget_duration = budget_duration;
            key.budget_reset_at = budget_duration.next_reset(now);
            key.expires_at = expires_in.as_deref().and_then(parse_duration).map(|d| now + d);

            state.store.insert_api_key(&key).await?;

            println!("key id:  {}", key.id);
            println!("key:     {}", minted.token);
            println!("         (store this credential now — it is not shown again)");
            Ok(())
        }
        KeyCommands::List {
            team_id,
            include_inactive,
        } => {
            let keys = state
                .store
                .list_api_keys(&KeyFilter {
                    team_id,
                    include_inactive,
                    ..Default::default()
                })
                .await?;
            for key in keys {
                println!(
                    "{}  {:<24} {:<10} active={} blocked={} spend=${:.4}",
                    key.id,
                    key.name,
                    key.key_type.as_str(),
                    key.is_active,
                    key.blocked,
                    key.spend
                );
            }
            Ok(())
        }
        KeyCommands::Revoke { key_id } => {
            state.store.delete_api_key(&key_id).await?;
            println!("key {} revoked", key_id);
            Ok(())
        }
    }
}
