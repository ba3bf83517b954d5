//! Configuration for an overlay node.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/overlay/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    probe: ProbeFileConfig,
    bt: BtFileConfig,
    rendezvous: RendezvousFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    listen_addr: Option<String>,
    identity_dir: Option<String>,
    dial_timeout_secs: Option<u64>,
    reconnect_jitter_max_ms: Option<u64>,
    log_dir: Option<String>,
}

/// `[probe]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ProbeFileConfig {
    interval_secs: Option<u64>,
    ttl: Option<u8>,
    probe_table_prune_secs: Option<u64>,
    routing_table_prune_secs: Option<u64>,
}

/// `[bt]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BtFileConfig {
    backlog: Option<usize>,
    max_uploads: Option<usize>,
    choker_tick_secs: Option<u64>,
    optimistic_unchoke_secs: Option<u64>,
}

/// `[rendezvous]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RendezvousFileConfig {
    announce_url: Option<String>,
    announce_interval_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved overlay node configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    // -- Network --
    /// Address to listen for incoming friend links on.
    pub listen_addr: String,
    /// Directory holding (or to receive) the persisted TLS identity.
    pub identity_dir: PathBuf,
    /// Timeout for dialing a friend's listen address.
    pub dial_timeout: Duration,
    /// Upper bound of the jittered delay before a reconnect attempt.
    pub reconnect_jitter_max: Duration,
    /// Directory to roll daily log files into, in addition to stderr.
    /// `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,

    // -- Probe/routing --
    /// Interval between probe cycles.
    pub probe_interval: Duration,
    /// TTL stamped on outgoing probes; valid range is 2..=15.
    pub probe_ttl: u8,
    /// Interval between probe-table prune sweeps.
    pub probe_table_prune_interval: Duration,
    /// Interval between routing-table prune sweeps.
    pub routing_table_prune_interval: Duration,

    // -- BitTorrent-style exchange --
    /// Maximum outstanding chunk requests per connection.
    pub bt_backlog: usize,
    /// Maximum simultaneously unchoked peers.
    pub bt_max_uploads: usize,
    /// Interval between choker reevaluations.
    pub choker_tick_interval: Duration,
    /// Interval between optimistic-unchoke rotations.
    pub optimistic_unchoke_interval: Duration,

    // -- Rendezvous (optional) --
    /// Announce service URL; `None` disables the publisher.
    pub rendezvous_announce_url: Option<String>,
    /// Interval between announce cycles.
    pub announce_interval: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7700".to_string(),
            identity_dir: default_identity_dir(),
            dial_timeout: Duration::from_secs(30),
            reconnect_jitter_max: Duration::from_millis(5000),
            log_dir: None,
            probe_interval: Duration::from_secs(15),
            probe_ttl: 10,
            probe_table_prune_interval: Duration::from_secs(15),
            routing_table_prune_interval: Duration::from_secs(30),
            bt_backlog: 10,
            bt_max_uploads: 4,
            choker_tick_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            rendezvous_announce_url: None,
            announce_interval: Duration::from_secs(60),
        }
    }
}

fn default_identity_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("overlay")
}

impl OverlayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve an `OverlayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. This is separated from `load()` to
    /// enable unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            listen_addr: cli
                .listen_addr
                .clone()
                .or_else(|| file.network.listen_addr.clone())
                .unwrap_or(defaults.listen_addr),
            identity_dir: cli
                .identity_dir
                .clone()
                .or_else(|| file.network.identity_dir.clone().map(PathBuf::from))
                .unwrap_or(defaults.identity_dir),
            dial_timeout: file
                .network
                .dial_timeout_secs
                .map_or(defaults.dial_timeout, Duration::from_secs),
            reconnect_jitter_max: file
                .network
                .reconnect_jitter_max_ms
                .map_or(defaults.reconnect_jitter_max, Duration::from_millis),
            log_dir: cli.log_dir.clone().or_else(|| file.network.log_dir.clone().map(PathBuf::from)),
            probe_interval: file.probe.interval_secs.map_or(defaults.probe_interval, Duration::from_secs),
            probe_ttl: file.probe.ttl.map_or(defaults.probe_ttl, |ttl| ttl.clamp(2, 15)),
            probe_table_prune_interval: file
                .probe
                .probe_table_prune_secs
                .map_or(defaults.probe_table_prune_interval, Duration::from_secs),
            routing_table_prune_interval: file
                .probe
                .routing_table_prune_secs
                .map_or(defaults.routing_table_prune_interval, Duration::from_secs),
            bt_backlog: file.bt.backlog.unwrap_or(defaults.bt_backlog),
            bt_max_uploads: file.bt.max_uploads.unwrap_or(defaults.bt_max_uploads),
            choker_tick_interval: file
                .bt
                .choker_tick_secs
                .map_or(defaults.choker_tick_interval, Duration::from_secs),
            optimistic_unchoke_interval: file
                .bt
                .optimistic_unchoke_secs
                .map_or(defaults.optimistic_unchoke_interval, Duration::from_secs),
            rendezvous_announce_url: cli
                .announce_url
                .clone()
                .or_else(|| file.rendezvous.announce_url.clone()),
            announce_interval: file
                .rendezvous
                .announce_interval_secs
                .map_or(defaults.announce_interval, Duration::from_secs),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Friend-to-friend overlay node")]
pub struct CliArgs {
    /// Address to listen for incoming friend links on.
    #[arg(long, env = "OVERLAY_LISTEN")]
    pub listen_addr: Option<String>,

    /// Directory holding the persisted TLS identity.
    #[arg(long, env = "OVERLAY_IDENTITY_DIR")]
    pub identity_dir: Option<PathBuf>,

    /// Rendezvous announce service URL (omit to disable).
    #[arg(long, env = "OVERLAY_ANNOUNCE_URL")]
    pub announce_url: Option<String>,

    /// Path to config file (default: `~/.config/overlay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "OVERLAY_LOG")]
    pub log_level: String,

    /// Directory to roll daily log files into (omit to log to stderr only).
    #[arg(long, env = "OVERLAY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as an empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents =
            std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile { path: p.to_path_buf(), source: e })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("overlay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_current_hardcoded_values() {
        let config = OverlayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:7700");
        assert_eq!(config.dial_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_jitter_max, Duration::from_millis(5000));
        assert_eq!(config.probe_interval, Duration::from_secs(15));
        assert_eq!(config.probe_ttl, 10);
        assert_eq!(config.probe_table_prune_interval, Duration::from_secs(15));
        assert_eq!(config.routing_table_prune_interval, Duration::from_secs(30));
        assert_eq!(config.bt_backlog, 10);
        assert_eq!(config.bt_max_uploads, 4);
        assert_eq!(config.choker_tick_interval, Duration::from_secs(10));
        assert_eq!(config.optimistic_unchoke_interval, Duration::from_secs(30));
        assert!(config.rendezvous_announce_url.is_none());
        assert_eq!(config.announce_interval, Duration::from_secs(60));
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[network]
listen_addr = "127.0.0.1:9000"
identity_dir = "/tmp/overlay-identity"
dial_timeout_secs = 5
reconnect_jitter_max_ms = 1000
log_dir = "/tmp/overlay-logs"

[probe]
interval_secs = 20
ttl = 7
probe_table_prune_secs = 10
routing_table_prune_secs = 40

[bt]
backlog = 20
max_uploads = 8
choker_tick_secs = 5
optimistic_unchoke_secs = 15

[rendezvous]
announce_url = "http://example.com/announce"
announce_interval_secs = 30
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs::default();
        let config = OverlayConfig::resolve(&cli, &file);

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.identity_dir, PathBuf::from("/tmp/overlay-identity"));
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_jitter_max, Duration::from_millis(1000));
        assert_eq!(config.probe_interval, Duration::from_secs(20));
        assert_eq!(config.probe_ttl, 7);
        assert_eq!(config.probe_table_prune_interval, Duration::from_secs(10));
        assert_eq!(config.routing_table_prune_interval, Duration::from_secs(40));
        assert_eq!(config.bt_backlog, 20);
        assert_eq!(config.bt_max_uploads, 8);
        assert_eq!(config.choker_tick_interval, Duration::from_secs(5));
        assert_eq!(config.optimistic_unchoke_interval, Duration::from_secs(15));
        assert_eq!(config.rendezvous_announce_url.as_deref(), Some("http://example.com/announce"));
        assert_eq!(config.announce_interval, Duration::from_secs(30));
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/overlay-logs")));
    }

    #[test]
    fn toml_parsing_partial() {
        let toml_str = r#"
[network]
listen_addr = "127.0.0.1:9000"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs::default();
        let config = OverlayConfig::resolve(&cli, &file);

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.bt_max_uploads, 4); // default
        assert!(config.rendezvous_announce_url.is_none());
    }

    #[test]
    fn probe_ttl_out_of_range_is_clamped() {
        let toml_str = "[probe]\nttl = 20\n";
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs::default();
        let config = OverlayConfig::resolve(&cli, &file);
        assert_eq!(config.probe_ttl, 15);

        let toml_str = "[probe]\nttl = 0\n";
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = OverlayConfig::resolve(&cli, &file);
        assert_eq!(config.probe_ttl, 2);
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[network]
listen_addr = "127.0.0.1:9000"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs { listen_addr: Some("0.0.0.0:3000".to_string()), ..Default::default() };
        let config = OverlayConfig::resolve(&cli, &file);

        assert_eq!(config.listen_addr, "0.0.0.0:3000");
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = load_config_file(None);
        assert!(result.is_ok());
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
