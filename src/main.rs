//! WolfPool Store Server
//!
//! Serves the coordination tree that builders, launchers and schedulers
//! share, over mutually authenticated TLS.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfpool::config::{build_hosts, LoggingConfig, ServerConfig, WolfPoolConfig};
use wolfpool::error::{Error, Result};
use wolfpool::store::{DataTree, StoreServer};
use wolfpool::tls;

/// WolfPool - coordination store server
#[derive(Parser)]
#[command(name = "wolfpool-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfpool.toml")]
    config: PathBuf,

    /// Log level, overrides the configured one
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the coordination tree until interrupted
    Start,

    /// Validate configuration file
    Validate,

    /// Show the effective configuration
    Info,

    /// Write a starter configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfpool.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Init { output } => run_init(output),
    }
}

/// Initialize logging; `RUST_LOG` wins over the configured level
fn init_logging(logging: &LoggingConfig, level: Option<&str>) {
    let level = level.unwrap_or(&logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn server_section(config: &WolfPoolConfig) -> Result<&ServerConfig> {
    config
        .server
        .as_ref()
        .ok_or_else(|| Error::Config("[server] section is required to run the store".into()))
}

/// Run the store server
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match WolfPoolConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            // Logging is not up yet
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    init_logging(&config.logging, log_level.as_deref());

    let server_config = server_section(&config)?;
    let acceptor = match tls::acceptor(&server_config.tls) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("Failed to load server TLS material: {}", e);
            return Err(e);
        }
    };

    let listener = match TcpListener::bind(&server_config.bind_address).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", server_config.bind_address, e);
            return Err(e.into());
        }
    };

    let server = StoreServer::new(
        Arc::new(DataTree::new()),
        server_config.max_session_timeout(),
    );
    tracing::info!(
        "Starting WolfPool store (max session timeout {:?})",
        server_config.max_session_timeout()
    );

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener, acceptor).await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
    server.stop();

    serving
        .await
        .map_err(|e| Error::Internal(format!("server task failed: {}", e)))?
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfPoolConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Servers: {}", build_hosts(&config.coordination.servers));
            println!("  Cache:   {}", config.coordination.enable_cache);
            if let Some(server) = &config.server {
                println!("  Bind Address: {}", server.bind_address);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show the effective configuration
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfPoolConfig::from_file(&config_path)?;
    let coordination = &config.coordination;

    println!("WolfPool Configuration");
    println!("======================");
    println!();
    println!("Coordination:");
    println!("  Hosts:          {}", build_hosts(&coordination.servers));
    println!("  Read Only:      {}", coordination.read_only);
    println!("  Session:        {:?}", coordination.session_timeout());
    println!("  Connect:        {:?}", coordination.connect_timeout());
    println!("  Cache:          {}", coordination.enable_cache);
    println!("  Delete Window:  {:?}", coordination.max_delete_age());
    if let Some(server) = &config.server {
        println!();
        println!("Store Server:");
        println!("  Bind Address:   {}", server.bind_address);
        println!("  Max Session:    {:?}", server.max_session_timeout());
    }
    println!();
    println!("Logging:          {} ({})", config.logging.level, config.logging.format);

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = r#"# WolfPool Configuration

[coordination]
read_only = false
session_timeout_secs = 10
connect_timeout_secs = 1
enable_cache = true
max_delete_age_secs = 300

[[coordination.servers]]
host = "localhost"
port = 2281
# chroot = "/nodepool"

[coordination.tls]
cert = "/etc/wolfpool/client.pem"
key = "/etc/wolfpool/client.key"
ca = "/etc/wolfpool/ca.pem"

[server]
bind_address = "0.0.0.0:2281"
max_session_timeout_secs = 40

[server.tls]
cert = "/etc/wolfpool/server.pem"
key = "/etc/wolfpool/server.key"
ca = "/etc/wolfpool/ca.pem"

[logging]
level = "info"
format = "pretty"
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the TLS paths, then start with: wolfpool-server --config {} start", output.display());

    Ok(())
}
