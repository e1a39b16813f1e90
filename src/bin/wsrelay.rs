//! wsrelay server binary (feature-gated).

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;
use wsrelay::config::{apply_env_overrides, apply_toml_config, parse_toml_file};
use wsrelay::{DefaultHandler, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "wsrelay", version, about = "Pre-forking WebSocket broadcast server")]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Interface to bind
    #[arg(long = "host")]
    host: Option<String>,

    /// Port to bind
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Number of worker processes
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Unix socket for local broadcast injection
    #[arg(long = "connector")]
    connector: Option<PathBuf>,
}

impl Cli {
    /// Defaults, then file, then env, then flags.
    fn resolve(self) -> wsrelay::Result<ServerConfig> {
        let mut config = ServerConfig::default();
        if let Some(path) = &self.config {
            apply_toml_config(&mut config, &parse_toml_file(path)?);
        }
        apply_env_overrides(&mut config)?;
        if let Some(host) = self.host {
            config = config.host(host);
        }
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(workers) = self.workers {
            config = config.workers(workers);
        }
        if let Some(connector) = self.connector {
            config = config.connector(connector);
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let result = Cli::parse()
        .resolve()
        .and_then(|config| Server::new(config).run(|_| DefaultHandler));
    match result {
        Ok(never) => match never {},
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "server stopped");
            ExitCode::FAILURE
        }
    }
}
