use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub mounts: Vec<MountConfig>,

    #[serde(default)]
    pub users: HashMap<String, UserConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum simultaneous connections, 0 for no limit
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum simultaneous connections from one peer address, 0 for no limit
    #[serde(default = "default_max_per_peer")]
    pub max_per_peer: usize,

    /// Seconds without socket activity before a session is closed, 0 disables
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Consecutive error replies on one connection before it is closed
    #[serde(default = "default_max_client_errors")]
    pub max_client_errors: u32,

    /// Socket read/write block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Close the connection after every request
    #[serde(default)]
    pub close: bool,

    /// Value of the `Server` response header
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// `Cache-Control` for static resources; `"none"` also disables ETags
    #[serde(default)]
    pub cache_control: Option<String>,

    #[serde(default)]
    pub cors: CorsMode,

    /// Render an HTML listing for GETs on directories
    #[serde(default)]
    pub directory_listing: bool,

    /// Ignore live producers when resolving reads
    #[serde(default)]
    pub static_mode: bool,

    /// Bytes a tailing reader may lag behind its producer, 0 for no limit
    #[serde(default)]
    pub max_backlog: u64,

    /// Largest body compressed up front, 0 disables compression
    #[serde(default = "default_compress_max")]
    pub compress_max: u64,

    /// Forward uploads to the ingest sink instead of persisting them
    #[serde(default)]
    pub source_mode: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_connections() -> usize {
    100
}
fn default_max_per_peer() -> usize {
    6
}
fn default_idle_timeout() -> u64 {
    4
}
fn default_max_client_errors() -> u32 {
    4
}
fn default_block_size() -> usize {
    4096
}
fn default_user_agent() -> String {
    format!("liveorigin/{}", env!("CARGO_PKG_VERSION"))
}
fn default_compress_max() -> u64 {
    50_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_per_peer: default_max_per_peer(),
            idle_timeout_secs: default_idle_timeout(),
            max_client_errors: default_max_client_errors(),
            block_size: default_block_size(),
            close: false,
            user_agent: default_user_agent(),
            cache_control: None,
            cors: CorsMode::default(),
            directory_listing: false,
            static_mode: false,
            max_backlog: 0,
            compress_max: default_compress_max(),
            source_mode: false,
        }
    }
}

impl ServerConfig {
    /// Whether ETags are emitted for static resources.
    pub fn etags_enabled(&self) -> bool {
        self.cache_control.as_deref() != Some("none")
    }
}

/// Cross-origin header policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CorsMode {
    /// Answer CORS only for requests carrying an `Origin` header
    #[default]
    Auto,
    /// Always send CORS headers
    On,
    /// Never send CORS headers
    Off,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveConfig {
    /// Producers hold until their first reader attaches
    #[serde(default = "default_true")]
    pub hold: bool,

    /// Closed resources kept per producer, 0 for no limit
    #[serde(default)]
    pub timeshift_depth: usize,

    /// Consecutive upstream failures before a producer is disconnected
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
}

fn default_true() -> bool {
    true
}
fn default_max_write_retries() -> u32 {
    3
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            hold: true,
            timeshift_depth: 0,
            max_write_retries: default_max_write_retries(),
        }
    }
}

/// Where a mount stores its resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Disk,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MountConfig {
    /// Local directory served by this mount (unused for memory mounts)
    #[serde(default)]
    pub path: PathBuf,

    /// URL prefix; the mount is served at `/` when unset
    #[serde(default)]
    pub name: Option<String>,

    /// Read principal: `$ALL`, `$NONE` or a comma list of users and `@groups`
    #[serde(default = "default_read")]
    pub read: String,

    /// Write principal, same syntax as `read`
    #[serde(default = "default_write")]
    pub write: String,

    #[serde(default)]
    pub backend: Backend,
}

fn default_read() -> String {
    "$ALL".to_string()
}
fn default_write() -> String {
    "$NONE".to_string()
}

impl MountConfig {
    /// Read-only disk mount of `path` at the URL root.
    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            read: default_read(),
            write: default_write(),
            backend: Backend::Disk,
        }
    }

    /// Memory mount at `/<name>`, readable and writable by everyone.
    pub fn memory(name: Option<&str>) -> Self {
        Self {
            path: PathBuf::new(),
            name: name.map(str::to_owned),
            read: default_read(),
            write: "$ALL".to_string(),
            backend: Backend::Memory,
        }
    }

    /// URL prefix this mount answers under, always starting with `/` and
    /// never ending with one (except the root itself).
    pub fn url_prefix(&self) -> String {
        match self.name.as_deref().map(|n| n.trim_matches('/')) {
            Some(n) if !n.is_empty() => format!("/{n}"),
            _ => "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    /// Bcrypt hash of the password (generate with `liveorigin hash-password`)
    pub password_hash: String,

    #[serde(default)]
    pub groups: Vec<String>,
}
