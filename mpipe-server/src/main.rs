use clap::{Parser, ValueEnum};
use mpipe_broker::{
    Broker, DurableStore, HttpTransport, HttpTransportConfig, InMemoryStore, ServerConfiguration,
};
use mpipe_server::{AppState, router, shutdown_signal};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "mpipe-server", version)]
#[command(about = "mpipe broker node")]
struct Cli {
    /// YAML configuration file (defaults plus MPIPE_* variables when absent)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port, overrides the configuration
    #[arg(long)]
    port: Option<u16>,

    /// Redis URL, overrides the configuration
    #[arg(long)]
    redis_url: Option<String>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

fn load_configuration(cli: &Cli) -> Result<ServerConfiguration, mpipe_broker::BrokerError> {
    let mut config = match &cli.config {
        Some(path) => ServerConfiguration::from_yaml_file(path)?,
        None => ServerConfiguration::from_env()?,
    };
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if let Some(url) = &cli.redis_url {
        config.redis_url = Some(url.clone());
    }
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "redis")]
async fn open_store(
    config: &ServerConfiguration,
) -> Result<Arc<dyn DurableStore>, mpipe_broker::BrokerError> {
    match &config.redis_url {
        Some(url) => {
            let store = mpipe_broker::RedisStore::new(url.clone()).await?;
            info!(url = %url, "Using Redis store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No Redis URL configured, using process-local store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn open_store(
    config: &ServerConfiguration,
) -> Result<Arc<dyn DurableStore>, mpipe_broker::BrokerError> {
    if config.redis_url.is_some() {
        return Err(mpipe_broker::BrokerError::Configuration(
            "built without the `redis` feature".to_string(),
        ));
    }
    warn!("Using process-local store");
    Ok(Arc::new(InMemoryStore::new()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_configuration(&cli)?;
    let store = open_store(&config).await?;
    let port = config.server_port;
    let concurrency = config.worker_pool_size;

    let broker = Arc::new(
        Broker::builder()
            .server_configuration(config)
            .store(store)
            .transport(Arc::new(HttpTransport::new(HttpTransportConfig::default())))
            .build()?,
    );
    broker.start().await?;

    let app = router(AppState::new(Arc::clone(&broker)), concurrency);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "mpipe server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker.stop().await;
    info!("mpipe server stopped");
    Ok(())
}
