use std::path::PathBuf;

use clap::Parser;
use palisade::{AppState, PalisadeConfig, observability, routes};

#[derive(Parser, Debug)]
#[command(version, about = "Palisade SAML Service Provider", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to palisade.toml in the working directory)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the service provider (default)
    Serve,
    /// Write a commented default configuration file
    Init {
        /// Path to create the config file (defaults to ./palisade.toml)
        #[arg(short, long)]
        output: Option<String>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

const DEFAULT_CONFIG_PATH: &str = "palisade.toml";

const DEFAULT_CONFIG: &str = r#"# Palisade SAML Service Provider configuration

[server]
host = "127.0.0.1"
port = 8000

[sp]
# This SP's identifier towards the IdP; register it there.
entity_id = "http://localhost:8000"
private_key_path = "sp.key"
certificate_path = "sp.cert"
# Externally reachable base URL, when it differs from the entity ID.
# base_url = "https://sso.example.com"
sign_requests = true

[idp]
metadata_url = "https://samltest.id/saml/idp"
refresh_interval_secs = 3600

[session]
cookie_name = "palisade_session"
duration_secs = 28800
# Disable only behind plain HTTP in local development.
secure = true

[validation]
clock_skew_secs = 90
pending_ttl_secs = 300

[observability.logging]
level = "info"
format = "pretty"
"#;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Init { output, force }) => {
            run_init(output, force);
        }
        Some(Command::Serve) | None => {
            run_server(args.config.as_deref()).await;
        }
    }
}

/// Write a default configuration file.
fn run_init(output: Option<String>, force: bool) {
    let output_path = PathBuf::from(output.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()));

    if output_path.exists() && !force {
        eprintln!(
            "Config file already exists: {}\nUse --force to overwrite.",
            output_path.display()
        );
        std::process::exit(1);
    }

    if let Err(e) = std::fs::write(&output_path, DEFAULT_CONFIG) {
        eprintln!("Failed to write config file: {}", e);
        std::process::exit(1);
    }

    println!("Created config file: {}", output_path.display());
    println!();
    println!("Point sp.private_key_path / sp.certificate_path at your key pair,");
    println!("set idp.metadata_url, then run:");
    println!("  palisade serve --config {}", output_path.display());
}

async fn run_server(explicit_config_path: Option<&str>) {
    let config_path = explicit_config_path.unwrap_or(DEFAULT_CONFIG_PATH);

    let config = match PalisadeConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    observability::init_tracing(&config.observability).expect("Failed to initialize tracing");

    tracing::info!(config_file = %config_path, "Starting SAML service provider");

    // Startup security warnings for risky configurations
    if !config.session.secure {
        tracing::warn!(
            "session.secure = false: the session cookie will travel over plain HTTP. \
             Acceptable for local development only."
        );
    }
    if !config.idp.require_https {
        tracing::warn!(
            "idp.require_https = false: metadata may be fetched over plain HTTP, \
             which lets an active attacker swap the IdP's signing certificates."
        );
    }

    let bind_addr = config.server.bind_addr();

    // Credential or metadata failures here are fatal; there is nothing to
    // serve without a key pair and a trust anchor.
    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    let app = routes::router(state);

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %bind_addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %bind_addr, "Service provider listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server exited with error");
        std::process::exit(1);
    }

    tracing::info!("Service provider stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
