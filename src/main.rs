mod cli;

use liveorigin::config::{self, Backend, MountConfig};
use liveorigin::server;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    mounts: Vec<PathBuf>,
    config_path: Option<&Path>,
) -> Result<()> {
    // Load config
    let mut config = config::load_config_or_default(config_path)?;

    // Override from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    for dir in mounts {
        config.mounts.push(MountConfig::disk(dir));
    }
    config::validate_config(&config)?;

    tracing::info!("Starting liveorigin");
    for mount in &config.mounts {
        tracing::info!(
            "Mount {} -> {} ({:?}, read={}, write={})",
            mount.url_prefix(),
            mount.path.display(),
            mount.backend,
            mount.read,
            mount.write
        );
    }

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "liveorigin=trace,liveorigin_vfs=debug,liveorigin_http=debug".to_string()
        } else {
            "liveorigin=info,liveorigin_vfs=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Serve { host, port, mounts } => {
            // The event loop runs on the runtime's main task.
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, mounts, cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::HashPassword { password } => hash_password(&password),
        Commands::Version => {
            println!("liveorigin {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!(
                "  Connections: max {} / {} per peer",
                config.server.max_connections, config.server.max_per_peer
            );
            println!("  Idle timeout: {}s", config.server.idle_timeout_secs);
            println!("  Mounts: {}", config.mounts.len());
            for mount in &config.mounts {
                let backend = match mount.backend {
                    Backend::Disk => "disk",
                    Backend::Memory => "memory",
                };
                println!("    {} ({}) {}", mount.url_prefix(), backend, mount.path.display());
            }
            println!("  Users: {}", config.users.len());
            println!("  Source mode: {}", config.server.source_mode);
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}

fn hash_password(password: &str) -> Result<()> {
    let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
    println!("{}", hash);
    Ok(())
}
