use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::auth::password::DEFAULT_ITERATIONS;
use crate::auth::ticket::DEFAULT_TICKET_TTL;

/// Relay hub server
///
/// Flags left unset on the command line do not override the TOML file or the
/// environment, so every value here is optional.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "relay-server", version, about = "Real-time relay hub")]
pub struct Cli {
    /// Port to listen on [default: 8080]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./relay.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,

    /// Store backend [default: sqlite]
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreBackend>,

    /// Data directory for the SQLite database [default: ./data]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Delete all users, messages and rooms before serving
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub clear_store_on_start: bool,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    pub store: StoreBackend,
    pub data_dir: String,
    pub clear_store_on_start: bool,

    /// Hub tuning (loaded from [hub] section in TOML)
    #[serde(default, skip_serializing)]
    pub hub: HubConfig,
}

#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// Timeouts, queue sizes and limits for the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Validity window of an unredeemed ticket (default: 5000)
    #[serde(default = "default_ticket_ttl_ms")]
    pub ticket_ttl_ms: u64,

    /// Interval between expired-ticket sweeps (default: 1000)
    #[serde(default = "default_ticket_sweep_interval_ms")]
    pub ticket_sweep_interval_ms: u64,

    /// Deadline for a whole login/register/upgrade exchange (default: 5000)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Per-connection outbound queue size; overflow disconnects (default: 64)
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Shared broadcast queue size (default: 256)
    #[serde(default = "default_broadcast_queue_capacity")]
    pub broadcast_queue_capacity: usize,

    /// Server ping interval, 0 disables (default: 30)
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Close a connection after this long without inbound frames (default: 90)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maximum messages returned by one history query (default: 50)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// PBKDF2 iterations for new registrations (default: 100000)
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Requests per IP allowed in a burst on /register and /login, 0 disables (default: 5)
    #[serde(default = "default_auth_rate_burst")]
    pub auth_rate_burst: u32,

    /// Seconds to replenish one request of the burst (default: 12)
    #[serde(default = "default_auth_rate_period_secs")]
    pub auth_rate_period_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ticket_ttl_ms: default_ticket_ttl_ms(),
            ticket_sweep_interval_ms: default_ticket_sweep_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            broadcast_queue_capacity: default_broadcast_queue_capacity(),
            ping_interval_secs: default_ping_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            history_limit: default_history_limit(),
            kdf_iterations: default_kdf_iterations(),
            auth_rate_burst: default_auth_rate_burst(),
            auth_rate_period_secs: default_auth_rate_period_secs(),
        }
    }
}

fn default_ticket_ttl_ms() -> u64 {
    DEFAULT_TICKET_TTL.as_millis() as u64
}

fn default_ticket_sweep_interval_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_broadcast_queue_capacity() -> usize {
    256
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_history_limit() -> usize {
    50
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

fn default_auth_rate_burst() -> u32 {
    5
}

fn default_auth_rate_period_secs() -> u64 {
    12
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            store: StoreBackend::Sqlite,
            data_dir: "./data".to_string(),
            clear_store_on_start: false,
            hub: HubConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RELAY_*) < CLI args
    pub fn load(cli: Cli) -> Result<Self, figment::Error> {
        Self::figment(&cli.config)
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// Defaults, TOML file and environment, without CLI flags.
    /// `RELAY_HUB__TICKET_TTL_MS` reaches `[hub] ticket_ttl_ms`.
    pub fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("RELAY_").split("__"))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Relay Hub Server Configuration
# Place this file at ./relay.toml or specify with --config <path>
# All settings can be overridden via environment variables (RELAY_PORT,
# RELAY_HUB__TICKET_TTL_MS, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Store backend: "sqlite" or "memory" (memory loses everything on exit)
# store = "sqlite"

# Data directory for the SQLite database
# data_dir = "./data"

# Wipe users, messages and rooms on startup
# clear_store_on_start = false

# ---- Hub ----
# [hub]

# Handshake
# ticket_ttl_ms = 5000              # Unredeemed tickets expire after this
# ticket_sweep_interval_ms = 1000   # Expired-ticket cleanup interval
# handshake_timeout_ms = 5000       # Deadline for login/register/upgrade
# kdf_iterations = 100000           # PBKDF2 iterations for new passwords

# Rate limit on /register and /login, per client IP
# auth_rate_burst = 5               # 0 disables the limiter
# auth_rate_period_secs = 12

# Connections
# outbound_queue_capacity = 64      # A client whose queue fills is disconnected
# broadcast_queue_capacity = 256
# ping_interval_secs = 30           # 0 disables server pings
# idle_timeout_secs = 90

# Chat
# history_limit = 50                # Max messages per history query
"#
    .to_string()
}
