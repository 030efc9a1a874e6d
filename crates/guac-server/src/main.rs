//! guac-server binary.

use clap::Parser;
use guac_core::token::format_key;
use guac_core::{generate_key, GuacError, GuacResult, TokenCipher, TokenPayload};
use guac_server::config::ConfigOverrides;
use guac_server::logging::{self, LogLevel};
use guac_server::{Gateway, GatewayConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long shutdown waits for sessions to finish closing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// guac-server: WebSocket gateway for guacd
#[derive(Parser, Debug)]
#[command(name = "guac-server", version, about = "WebSocket gateway for guacd")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.guac/config.toml")]
    config: String,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// guacd host
    #[arg(long)]
    daemon_host: Option<String>,

    /// guacd port
    #[arg(long)]
    daemon_port: Option<u16>,

    /// Close browser connections idle for this long (0 disables)
    #[arg(long)]
    max_inactivity_ms: Option<u64>,

    /// Log level
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,

    /// Print a new random key for the configured cipher and exit
    #[arg(long)]
    generate_key: bool,

    /// Encrypt the token payload in this JSON file, print the token and exit
    #[arg(long, value_name = "JSON")]
    issue_token: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        bind: cli.bind.clone(),
        port: cli.port,
        daemon_host: cli.daemon_host.clone(),
        daemon_port: cli.daemon_port,
        max_inactivity_ms: cli.max_inactivity_ms,
        log_level: cli.log_level,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    logging::init(config.log_level);

    if cli.generate_key {
        match generate_key(config.cipher) {
            Ok(key) => println!("{}", format_key(&key)),
            Err(e) => {
                error!(error = %e, "failed to generate key");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Some(path) = &cli.issue_token {
        match issue_token(&config, path) {
            Ok(token) => println!("{token}"),
            Err(e) => {
                error!(error = %e, "failed to issue token");
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr,
        daemon = %config.daemon.address(),
        "starting guac-server"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!(error = %e, "failed to create gateway");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = Arc::clone(&gateway).run() => {
            if let Err(e) = result {
                error!(error = %e, "gateway error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    gateway.close().await;
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while gateway.active_sessions().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(sessions = gateway.active_sessions().await, "sessions still open at exit");
    }

    info!("guac-server stopped");
}

/// Encrypt a `{"connection": {...}}` JSON file with the configured key.
fn issue_token(config: &GatewayConfig, path: &Path) -> GuacResult<String> {
    let key = config
        .key
        .as_deref()
        .ok_or_else(|| GuacError::Config("no token key configured ([crypt] key)".into()))?;
    let cipher = TokenCipher::new(config.cipher, key)?;
    let payload: TokenPayload = serde_json::from_slice(&std::fs::read(path)?)?;
    cipher.encrypt(&payload)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
