mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./liveorigin.toml",
        "~/.config/liveorigin/config.toml",
        "/etc/liveorigin/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    let server = &config.server;
    if server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }
    if server.block_size == 0 {
        anyhow::bail!("Block size cannot be 0");
    }
    if server.max_per_peer > 0
        && server.max_connections > 0
        && server.max_per_peer > server.max_connections
    {
        tracing::warn!(
            "max_per_peer ({}) exceeds max_connections ({})",
            server.max_per_peer,
            server.max_connections
        );
    }
    if server.idle_timeout_secs == 0 {
        tracing::warn!("Idle timeout disabled, stalled clients are never closed");
    }

    if config.mounts.is_empty() {
        tracing::warn!("No mounts configured, only live producers will be served");
    }

    let mut prefixes = std::collections::HashSet::new();
    for mount in &config.mounts {
        if mount.backend == Backend::Disk && !mount.path.is_dir() {
            anyhow::bail!("Mount path is not a directory: {:?}", mount.path);
        }
        if !prefixes.insert((mount.url_prefix(), mount.path.clone())) {
            tracing::warn!("Mount {:?} listed twice under {}", mount.path, mount.url_prefix());
        }
        for principal in [&mount.read, &mount.write] {
            validate_principal(principal, config)
                .with_context(|| format!("Invalid principal for mount {:?}", mount.path))?;
        }
    }

    for (name, user) in &config.users {
        if !user.password_hash.starts_with("$2") {
            anyhow::bail!("User '{}' has a password_hash that is not a bcrypt hash", name);
        }
    }

    Ok(())
}

fn validate_principal(principal: &str, config: &Config) -> Result<()> {
    let principal = principal.trim();
    if principal == "$ALL" || principal == "$NONE" {
        return Ok(());
    }
    for entry in principal.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if let Some(group) = entry.strip_prefix('@') {
            let known = config
                .users
                .values()
                .any(|u| u.groups.iter().any(|g| g == group));
            if !known {
                anyhow::bail!("Unknown group '{}'", group);
            }
        } else if !config.users.contains_key(entry) {
            tracing::warn!("Principal names unknown user '{}'", entry);
        }
    }
    Ok(())
}
