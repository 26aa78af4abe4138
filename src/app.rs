use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::{
    answer::OpenAiAnswerGenerator,
    client::{BridgeChatClient, BridgeEventRouter, ChatClient, MemoryChatClient},
    config::{ChatClientKind, Config, StoreKind},
    manager::SessionManager,
    reconcile::ReconciliationScheduler,
    registry::SessionRegistry,
    routes::{build_app, AppState},
    store::{MemoryRecordStore, PgRecordStore, RecordStore},
};

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn RecordStore>> {
    match config.store.kind {
        StoreKind::Memory => {
            warn!("using in-memory record store; contacts are lost on restart");
            let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
            Ok(store)
        }
        StoreKind::Postgres => {
            let db = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.store.database_url)
                .await
                .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?;
            let store = PgRecordStore::new(db);
            store.migrate().await.context("failed to run sqlx migrations")?;
            let store: Arc<dyn RecordStore> = Arc::new(store);
            Ok(store)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

pub async fn run() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let http = reqwest::Client::new();
    let store = open_store(&config).await?;

    let (client, bridge_events): (Arc<dyn ChatClient>, Option<Arc<BridgeEventRouter>>) =
        match config.chat.kind {
            ChatClientKind::Memory => {
                warn!("using in-memory chat client; no messages leave this process");
                let client: Arc<dyn ChatClient> = Arc::new(MemoryChatClient::new());
                (client, None)
            }
            ChatClientKind::Bridge => {
                let router = Arc::new(BridgeEventRouter::new());
                let client: Arc<dyn ChatClient> = Arc::new(BridgeChatClient::new(
                    http.clone(),
                    &config.chat.bridge_url,
                    &config.chat.bridge_token,
                    &config.public_base_url,
                    router.clone(),
                ));
                (client, Some(router))
            }
        };

    if config.openai.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; customer replies will not be answered");
    }
    let answers = Arc::new(OpenAiAnswerGenerator::new(
        http,
        &config.openai.api_key,
        &config.openai.model,
        &config.openai.base_url,
        &config.openai.business_name,
    ));

    let registry = Arc::new(SessionRegistry::new());
    let manager = Arc::new(SessionManager::new(
        registry.clone(),
        client,
        store,
        answers,
        config.session_settings(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = Arc::new(ReconciliationScheduler::new(
        registry,
        manager.dispatcher().clone(),
        config.reconcile_interval,
    ))
    .spawn(stop_rx);

    let state = Arc::new(AppState {
        manager: manager.clone(),
        bridge_events,
        bridge_secret: config.chat.webhook_secret.clone(),
        api_token: config.api_token.clone(),
    });
    let app = build_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind TCP listener on {addr}"))?;

    info!(port = config.port, "recovery server running at http://localhost:{}", config.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failure")?;

    let _ = stop_tx.send(true);
    if let Err(err) = scheduler.await {
        warn!(error = %err, "reconciliation scheduler ended abnormally");
    }
    manager.shutdown().await;
    info!("recovery server stopped");
    Ok(())
}
