use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use critiq::api::{self, AppState};
use critiq::config::Config;
use critiq::db::Database;
use critiq::inference::{create_provider, VisionProvider};
use critiq::jobs::JobManager;
use critiq::logging;

#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    bind: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("critiq {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    parsed.bind = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: --bind requires an address argument");
                    std::process::exit(1);
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"critiq - photo critique service

USAGE:
    critiq [OPTIONS]

OPTIONS:
    --config, -c PATH   Path to config file
    --bind, -b ADDR     Listen address (overrides server.bind)
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    CRITIQ_CONFIG       Path to config file (overrides default location)
    CRITIQ_LOG          Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/critiq/config.toml

See also: critiq-index --help"#
    );
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // Journald on Linux, rolling file otherwise
    let _ = logging::init(Some(Config::config_dir().join("logs")), false);

    let config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    if config.advisors.is_empty() {
        warn!("No advisors configured; every submission will be rejected");
    }

    let db = Database::open(&config.storage.db_path)
        .with_context(|| format!("Failed to open {}", config.storage.db_path.display()))?;
    db.initialize()?;
    let db = Arc::new(db);

    let provider: Arc<dyn VisionProvider> = Arc::from(create_provider(&config.inference));
    let manager = JobManager::from_config(&config, Arc::clone(&db), provider);
    let handle = manager.start()?;

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(
        bind = %bind,
        provider = ?config.inference.provider,
        model = %config.inference.model,
        advisors = config.advisors.len(),
        "critiq listening"
    );

    axum::serve(listener, api::router(AppState::new(manager)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    handle.shutdown().await;
    Ok(())
}
