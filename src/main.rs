use anyhow::Result;
use clap::{Parser, Subcommand};
use climanger_relay::{config::RelayConfig, credentials::store::PairingStore, gateway, host, AppContext};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "climanger-relay",
    about = "CLI Manager relay — pairs desktop terminals with mobile clients",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Gateway listen port
    #[arg(long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Data directory for the pairing-code store and config.toml
    #[arg(long, env = "RELAY_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "RELAY_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay service (default when no subcommand given).
    ///
    /// Requires JWT_SECRET. Tunables come from env vars or config.toml:
    /// ALLOWED_ORIGINS, ENVIRONMENT, MAX_CONNECTIONS_PER_DEVICE,
    /// PIN_EXPIRY_SECONDS, SESSION_EXPIRY_SECONDS.
    ///
    /// Examples:
    ///   JWT_SECRET=... climanger-relay serve
    ///   JWT_SECRET=... climanger-relay serve --port 9000
    Serve,
    /// Run the desktop host agent.
    ///
    /// Opens a persistent outbound connection to the relay and serves
    /// PTY-backed terminal sessions to paired mobile clients. Reconnects
    /// automatically with exponential backoff.
    ///
    /// Examples:
    ///   climanger-relay host --device-id swift-tiger-42 \
    ///       --relay-url wss://relay.example --workspace ~/projects/api
    Host {
        /// Relay base URL
        #[arg(long, env = "RELAY_URL", default_value = "ws://127.0.0.1:8787")]
        relay_url: String,
        /// Stable device identifier (word-word-NN)
        #[arg(long, env = "DEVICE_ID")]
        device_id: String,
        /// Human-readable device name shown to mobiles
        #[arg(long, env = "DEVICE_NAME")]
        device_name: Option<String>,
        /// Workspace directory offered to mobiles (repeatable)
        #[arg(long = "workspace")]
        workspaces: Vec<std::path::PathBuf>,
        /// Shell to spawn for sessions (default: $SHELL or /bin/sh)
        #[arg(long)]
        shell: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── Logging setup ────────────────────────────────────────────────────────
    // Init once — must happen before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Host {
            relay_url,
            device_id,
            device_name,
            workspaces,
            shell,
        }) => {
            let device_name = device_name.unwrap_or_else(host_name);
            host::run(host::HostConfig {
                relay_url,
                device_id,
                device_name,
                workspaces,
                shell,
            })
            .await
        }
        None | Some(Command::Serve) => run_serve(args.port, args.data_dir, args.log).await,
    }
}

/// Resolve the host machine's display name.
///
/// Priority: `HOSTNAME` env var → `COMPUTERNAME` env var (Windows) → "Desktop".
fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "Desktop".to_string())
}

async fn run_serve(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let config = RelayConfig::new(port, data_dir, log)?;
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        environment = %config.environment,
        max_connections_per_device = config.max_connections_per_device,
        pin_expiry_seconds = config.pin_expiry_seconds,
        "config loaded"
    );

    let pairing = PairingStore::open(&config.data_dir).await?;
    let ctx = Arc::new(AppContext::new(config, pairing));

    gateway::serve(ctx).await
}

/// Initialize the tracing subscriber: compact stdout logging, plus a
/// daily-rolling file when `--log-file` is set. The returned `WorkerGuard`
/// must stay alive for the process lifetime or buffered file logs are lost.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let file_layer = log_file.and_then(|path| {
        let dir = match path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => std::path::Path::new("."),
        };
        if let Err(e) = std::fs::create_dir_all(dir) {
            // A bad log path must not stop the relay; stdout still works.
            eprintln!("warn: log directory '{}' unavailable: {e}", dir.display());
            return None;
        }
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("relay.log"));
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, filename));
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        Some((layer, guard))
    });

    let stdout = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact());
    match file_layer {
        Some((layer, guard)) => {
            stdout.with(layer).init();
            Some(guard)
        }
        None => {
            stdout.init();
            None
        }
    }
}
