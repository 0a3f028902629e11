use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_ENVIRONMENT: &str = "dev";
const DEFAULT_MAX_CONNECTIONS_PER_DEVICE: usize = 3;
const DEFAULT_PIN_EXPIRY_SECONDS: u64 = 300;
const DEFAULT_SESSION_EXPIRY_SECONDS: u64 = 86_400;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Gateway listen port (default: 8787).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,climanger_relay=trace".
    log: Option<String>,
    /// HMAC secret for bearer tokens. Required here or via JWT_SECRET.
    jwt_secret: Option<String>,
    /// Comma-separated CORS allow-list; `*` disables the list.
    allowed_origins: Option<String>,
    /// Informational environment label (default: "dev").
    environment: Option<String>,
    /// Mobile attachment cap per device room (default: 3).
    max_connections_per_device: Option<usize>,
    /// Pairing-code TTL in seconds (default: 300).
    pin_expiry_seconds: Option<u64>,
    /// Bearer-token TTL in seconds (default: 86400).
    session_expiry_seconds: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ─── RelayConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Process-global token signing secret. Read-only at runtime.
    pub jwt_secret: String,
    /// CORS allow-list. A `*` entry disables the list.
    pub allowed_origins: Vec<String>,
    /// Informational label; also selects the scheme used in `qr_data`.
    pub environment: String,
    /// Mobile attachment cap per device room.
    pub max_connections_per_device: usize,
    /// Pairing-code TTL in seconds.
    pub pin_expiry_seconds: u64,
    /// Bearer-token TTL in seconds.
    pub session_expiry_seconds: u64,
}

impl RelayConfig {
    /// Build config from CLI args + env vars + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI flag — passed as `Some(value)` from clap
    ///   2. Env var (JWT_SECRET, ALLOWED_ORIGINS, ENVIRONMENT,
    ///      MAX_CONNECTIONS_PER_DEVICE, PIN_EXPIRY_SECONDS,
    ///      SESSION_EXPIRY_SECONDS)
    ///   3. TOML file at `{data_dir}/config.toml`
    ///   4. Built-in defaults
    ///
    /// `JWT_SECRET` is the one required option; startup fails without it.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let jwt_secret = env_var("JWT_SECRET")
            .or(toml.jwt_secret)
            .ok_or_else(|| anyhow::anyhow!("JWT_SECRET is required (env var or config.toml)"))?;

        let allowed_origins = parse_origins(
            &env_var("ALLOWED_ORIGINS")
                .or(toml.allowed_origins)
                .unwrap_or_else(|| "*".to_string()),
        );

        let environment = env_var("ENVIRONMENT")
            .or(toml.environment)
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let max_connections_per_device = env_var("MAX_CONNECTIONS_PER_DEVICE")
            .and_then(|v| v.parse().ok())
            .or(toml.max_connections_per_device)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_DEVICE);

        let pin_expiry_seconds = env_var("PIN_EXPIRY_SECONDS")
            .and_then(|v| v.parse().ok())
            .or(toml.pin_expiry_seconds)
            .unwrap_or(DEFAULT_PIN_EXPIRY_SECONDS);

        let session_expiry_seconds = env_var("SESSION_EXPIRY_SECONDS")
            .and_then(|v| v.parse().ok())
            .or(toml.session_expiry_seconds)
            .unwrap_or(DEFAULT_SESSION_EXPIRY_SECONDS);

        Ok(Self {
            port,
            data_dir,
            log,
            jwt_secret,
            allowed_origins,
            environment,
            max_connections_per_device,
            pin_expiry_seconds,
            session_expiry_seconds,
        })
    }

    /// Returns `true` when the allow-list contains `*`.
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/climanger-relay
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("climanger-relay");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/climanger-relay or ~/.local/share/climanger-relay
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("climanger-relay");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("climanger-relay");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\climanger-relay
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("climanger-relay");
        }
    }
    // Fallback
    PathBuf::from(".climanger-relay")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_origins_splits_and_trims() {
        assert_eq!(
            parse_origins("https://a.example, https://b.example"),
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(parse_origins("*"), vec!["*"]);
        assert_eq!(parse_origins(""), Vec::<String>::new());
    }

    #[test]
    fn wildcard_disables_allow_list() {
        let mut cfg = RelayConfig::for_tests();
        assert!(cfg.allows_any_origin());
        cfg.allowed_origins = vec!["https://a.example".into()];
        assert!(!cfg.allows_any_origin());
    }
}

impl RelayConfig {
    /// A fully defaulted config for unit and integration tests.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            data_dir: PathBuf::from("."),
            log: "warn".into(),
            jwt_secret: "test-secret".into(),
            allowed_origins: vec!["*".into()],
            environment: "dev".into(),
            max_connections_per_device: DEFAULT_MAX_CONNECTIONS_PER_DEVICE,
            pin_expiry_seconds: DEFAULT_PIN_EXPIRY_SECONDS,
            session_expiry_seconds: DEFAULT_SESSION_EXPIRY_SECONDS,
        }
    }
}
