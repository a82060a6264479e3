use clap::{Parser, ValueEnum};
use equity_core::EquityStorageConfig;
use equity_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "equityd", version, about = "Equity accounting REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092", env = "EQUITY_LISTEN")]
    listen: SocketAddr,
    /// Storage backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "EQUITY_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url. Falls back to DATABASE_URL.
    #[arg(long, env = "EQUITY_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "EQUITY_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// HS256 secret used to verify bearer tokens (at least 32 characters).
    #[arg(long, env = "EQUITY_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<EquityStorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => EquityStorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            EquityStorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => {
                EquityStorageConfig::postgres(database_url, cli.pg_max_connections)
            }
            None => EquityStorageConfig::Memory,
        },
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "equity_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    info!(backend = storage.label(), "resolved storage backend");

    let state = ServiceState::bootstrap(ServiceConfig {
        storage,
        jwt_secret: cli.jwt_secret.clone(),
    })
    .await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("equity-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
