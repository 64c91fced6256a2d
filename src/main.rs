use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turn_relay::{
    api::{build_router, ChatState},
    chat::{ChatService, MemoryConversationStore, MemoryLedgerStore, SeedData},
    config::{Config, LoggingConfig},
    upstream::AssistantsClient,
};

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path).context("failed to load configuration")?;
    init_tracing(&config.logging);

    let conversations = Arc::new(MemoryConversationStore::new());
    let ledgers = Arc::new(MemoryLedgerStore::new());

    match &config.store.seed_path {
        Some(path) => {
            let seed = SeedData::from_file(path)
                .with_context(|| format!("failed to read seed data from {}", path))?;
            seed.load_into(&conversations, &ledgers).await;
            info!("Loaded seed data from {}", path);
        }
        None => warn!("No seed data configured, starting with empty stores"),
    }

    if !config.upstream.enabled {
        warn!("Upstream integration is disabled, turns will be rejected");
    }
    let upstream = Arc::new(
        AssistantsClient::new(config.upstream.clone())
            .context("failed to build upstream client")?,
    );

    let service = ChatService::new(conversations, ledgers, upstream, config.turn_settings());
    let state = ChatState {
        service: Arc::new(service),
    };
    let router = build_router(state, config.server.max_body_bytes);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Turn relay listening on {}", addr);

    axum::serve(listener, router).await?;
    Ok(())
}
