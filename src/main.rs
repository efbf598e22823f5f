use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LogFormat, LoggingConfig, RatewardenConfig, StoreBackend};
use ratewarden::ratelimit::{ClientIdentifier, RateLimiter, RouteTable};
use ratewarden::server::GatewayServer;
use ratewarden::store;

/// Rate limiting gateway backed by a shared sliding-window store.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the Redis connection URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Use the process-local store instead of Redis
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_tracing(&config.logging)?;

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        routes = config.routes.len(),
        "Configuration loaded"
    );

    let identifier = ClientIdentifier::with_headers(
        &config.identity.api_key_header,
        &config.identity.forwarded_for_header,
    )?;
    let routes = Arc::new(RouteTable::from_rules(&config.routes, &identifier)?);

    let store = store::open(&config.store).await?;
    info!("Window store ready");

    let limiter = Arc::new(
        RateLimiter::new(store.clone())
            .with_key_prefix(config.store.key_prefix.clone())
            .with_command_timeout(config.store.command_timeout()),
    );

    let server = GatewayServer::new(config.server.listen_addr, limiter, routes);

    // Run the server with graceful shutdown on Ctrl+C
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    store.close().await;
    served?;

    info!("Ratewarden stopped");
    Ok(())
}

/// Load configuration and apply command line overrides.
/// Validation runs again because an override can invalidate loaded settings.
fn load_config(cli: &Cli) -> anyhow::Result<RatewardenConfig> {
    let mut config = RatewardenConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(url) = &cli.redis_url {
        config.store.redis_url = url.clone();
    }
    if cli.memory {
        config.store.backend = StoreBackend::Memory;
    }
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining connections");
        }
        _ = terminate => {
            info!("Received SIGTERM, draining connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(yaml: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn test_overrides_are_applied() {
        let path = write_config("store:\n  key_prefix: gateway\n");
        let cli = Cli::parse_from([
            "ratewarden",
            "--config",
            path.to_str().unwrap(),
            "--listen",
            "0.0.0.0:9090",
            "--memory",
        ]);

        let config = load_config(&cli).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server.listen_addr.port(), 9090);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.key_prefix, "gateway");
    }

    #[test]
    fn test_memory_override_revalidates_sweep_interval() {
        let path = write_config("store:\n  backend: redis\n  sweep_interval_secs: 0\n");
        let cli = Cli::parse_from(["ratewarden", "--config", path.to_str().unwrap(), "--memory"]);

        let result = load_config(&cli);
        std::fs::remove_file(&path).unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("sweep_interval_secs"));
    }
}
