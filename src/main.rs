use tracing::{error, info};

use modhost::{Config, Database, ModuleService};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    // Initialize logging
    if let Err(e) = modhost::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        modhost::logging::init_console_only(&config.logging.level);
    }

    info!("Modhost - module host");

    if let Err(e) = run(config).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> modhost::Result<()> {
    let db = Database::open(&config.database.path).await?;
    info!("Database opened at {}", config.database.path);

    let service = ModuleService::open(&db, &config.modules).await?;
    let decayer = service.spawn_decayer();
    info!(
        modules = service.store().list().await.len(),
        "Ready, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    decayer.abort();
    drop(service);
    db.close().await;
    Ok(())
}
