use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use umbral::config::{Config, ConfigError, RouteConfig};
use umbral::Umbral;

#[derive(Parser)]
#[command(name = "umbral")]
#[command(about = "A cluster-aware database proxy for Galera and Redis Clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Umbral Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Route protocol (galera, redis_cluster or tcp)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_umbral(config).await,
        Commands::Config { mode, output } => generate_config(&mode, output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

async fn run_umbral(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!("Starting umbral v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);

    let umbral = Umbral::from_config(config).context("Failed to build route handlers")?;
    let started = umbral.start_all().await.context("Failed to start routes")?;
    info!("{} routes running", started.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    for snapshot in umbral.stats() {
        info!(
            "Route {} ({}) served {} connections, {} queries",
            snapshot.name,
            snapshot.protocol,
            snapshot.stats.total_connections,
            snapshot.stats.queries
        );
    }

    umbral.stop_all().await.context("Failed to stop routes cleanly")?;
    Ok(())
}

fn generate_config(mode: &str, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  umbral run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Bind host: {}", config.server.bind_host);
            println!(
                "  Max connections per route: {}",
                config.server.max_connections_per_route
            );
            println!("  Routes: {}", config.routes.len());

            for route in &config.routes {
                let common = route.common();
                println!(
                    "    {} [{}] on port {} -> {} backends",
                    common.name,
                    route.protocol(),
                    common.listen_port,
                    common.backends.len()
                );
                for backend in &common.backends {
                    println!("      {} (weight {})", backend.key(), backend.weight);
                }
                if let RouteConfig::RedisCluster(redis) = route {
                    println!(
                        "      slot refresh every {}s, ping timeout {}ms",
                        redis.refresh_interval_sec, redis.ping_timeout_ms
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("umbral v{}", env!("CARGO_PKG_VERSION"));
    println!("A cluster-aware database proxy for Galera and Redis Clusters");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Galera node health tracking with weighted backend selection");
    println!("  • Redis Cluster slot routing with MOVED/ASK handling");
    println!("  • Raw TCP passthrough with round-robin rotation");
    println!("  • Per-route connection and query rate limiting");
}

/// `RUST_LOG` wins over the configured level when set
fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
