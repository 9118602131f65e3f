//! Redressal daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! redressal
//!
//! # Custom config, port and storage directory
//! redressal --config /etc/redressal.toml --http-port 8096 --storage-dir /data/redressal
//!
//! # Mint a token for local testing (uses the same JWT_SECRET)
//! redressal issue-token --user-id citizen-1 --role citizen
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use redressal::auth::TokenInput;
use redressal::db::Role;
use redressal::services::spawn_logging_listener;
use redressal::{Config, GrievanceDb, HttpServer, JwtValidator, Services};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "redressal")]
#[command(about = "Grievance lifecycle and escalation engine")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory (database and default config)
    #[arg(long, env = "REDRESSAL_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "REDRESSAL_HTTP_PORT")]
    http_port: Option<u16>,

    /// HS256 secret shared with the auth service
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Print a signed bearer token
    IssueToken {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        role: Role,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        email: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("redressal=info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let jwt = build_validator(&config)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, jwt).await,
        Command::IssueToken {
            user_id,
            role,
            name,
            email,
        } => {
            let token = jwt.generate_token(TokenInput {
                user_id,
                name,
                email,
                role,
            })?;
            println!("{}", token);
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let default_path = args
                .storage_dir
                .clone()
                .unwrap_or_else(redressal::config::default_storage_dir)
                .join("config.toml");
            if default_path.exists() {
                Config::load(&default_path)
                    .with_context(|| format!("failed to load {}", default_path.display()))?
            } else {
                Config::default()
            }
        }
    };

    // CLI and environment win over the file
    if let Some(dir) = &args.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(secret) = &args.jwt_secret {
        config.jwt_secret = secret.clone();
    }

    if let Err(e) = config.validate() {
        bail!("invalid configuration: {}", e);
    }
    Ok(config)
}

fn build_validator(config: &Config) -> anyhow::Result<JwtValidator> {
    if config.jwt_secret.is_empty() {
        warn!("JWT_SECRET not set, using the dev-mode secret. Do not run like this in production.");
        return Ok(JwtValidator::new_dev());
    }
    Ok(JwtValidator::new(
        config.jwt_secret.clone(),
        config.jwt_expiry_seconds,
    )?)
}

async fn serve(config: Config, jwt: JwtValidator) -> anyhow::Result<()> {
    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        "Starting redressal"
    );

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let config_path = config.config_path();
    if !config_path.exists() {
        // Never persist a secret that came from the environment
        let on_disk = Config {
            jwt_secret: String::new(),
            ..config.clone()
        };
        on_disk.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(GrievanceDb::open(&config.storage_dir)?.with_write_retries(config.write_retries));
    let services = Arc::new(Services::new(db, config.service_settings()));
    let listener_handle = spawn_logging_listener(services.events.clone());

    let sweep_handle = spawn_sweep(services.clone(), config.sweep_interval_secs);

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(services.clone(), jwt, http_addr));
    info!("HTTP API available at http://{}", http_addr);

    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    sweep_handle.abort();
    listener_handle.abort();

    if let Ok(stats) = services.db.stats() {
        info!(
            grievances = stats.grievance_count,
            upvotes = stats.upvote_count,
            expenses = stats.expense_count,
            "Final store stats"
        );
    }

    Ok(())
}

/// Periodically auto-close resolved grievances nobody confirmed
fn spawn_sweep(services: Arc<Services>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let grievances = services.grievances.clone();
            match tokio::task::spawn_blocking(move || grievances.sweep_stale_resolved()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Auto-close sweep failed"),
                Err(e) => error!(error = %e, "Auto-close sweep panicked"),
            }
        }
    })
}
