//! LinkShare Signal Server
//!
//! WebSocket rendezvous server pairing two clients by a short token.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, or ~/.config/linkshare/config.toml if present
//! linkshare-signal --port 8000
//!
//! # Explicit config file, local environment exposing /docs
//! ENVIRONMENT=local linkshare-signal --config ./linkshare.toml
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use linkshare_core::{Config, Environment};
use linkshare_signal::SignalServer;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "linkshare-signal")]
#[command(about = "LinkShare rendezvous server for token-based device pairing")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); defaults to the platform config directory
    #[arg(short, long, env = "LINKSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "LINKSHARE_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "LINKSHARE_BIND")]
    bind: Option<IpAddr>,

    /// Deployment environment (local, staging, production)
    #[arg(long, env = "ENVIRONMENT")]
    environment: Option<Environment>,

    /// Take the client origin from X-Forwarded-For
    #[arg(long, env = "LINKSHARE_TRUST_FORWARDED_FOR")]
    trust_forwarded_for: Option<bool>,

    /// Issued token length
    #[arg(long, env = "LINKSHARE_TOKEN_LENGTH")]
    token_length: Option<usize>,

    /// Seconds of silence before a connection is closed
    #[arg(long, env = "LINKSHARE_INACTIVITY_TIMEOUT")]
    inactivity_timeout: Option<u64>,

    /// Connections admitted per origin per window
    #[arg(long, env = "LINKSHARE_RATE_LIMIT")]
    rate_limit: Option<u32>,

    /// Rate limit window in seconds
    #[arg(long, env = "LINKSHARE_RATE_WINDOW")]
    rate_window: Option<u64>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", env = "LINKSHARE_LOG_FORMAT")]
    log_format: LogFormat,
}

impl Args {
    fn into_config(self) -> Result<Config, linkshare_core::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(environment) = self.environment {
            config.server.environment = environment;
        }
        if let Some(trust) = self.trust_forwarded_for {
            config.server.trust_forwarded_for = trust;
        }
        if let Some(length) = self.token_length {
            config.session.token_length = length;
        }
        if let Some(timeout) = self.inactivity_timeout {
            config.session.inactivity_timeout_secs = timeout;
        }
        if let Some(limit) = self.rate_limit {
            config.limits.connections_per_window = limit;
        }
        if let Some(window) = self.rate_window {
            config.limits.window_secs = window;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    match args.log_format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }

    let config = args.into_config()?;

    info!("Starting LinkShare Signal Server");
    info!(
        "Environment: {} (docs {})",
        config.server.environment,
        if config.server.environment.shows_docs() {
            "exposed"
        } else {
            "hidden"
        }
    );
    info!(
        "Tokens: {} chars, inactivity timeout {}s, {} connections per {}s per origin",
        config.session.token_length,
        config.session.inactivity_timeout_secs,
        config.limits.connections_per_window,
        config.limits.window_secs
    );

    let server = SignalServer::new(config)?;

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
