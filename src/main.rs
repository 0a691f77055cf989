//! Portal - Programmable Edge Serving Layer
//!
//! Main entry point. Wires together:
//! - Configuration from the environment
//! - The embedded key-value store for persisted counters
//! - The application context (caches, accounting, monitors)
//! - Background workers (QPS samplers, histogram persistence, the
//!   overload monitor)
//! - The data-plane and control-plane HTTP listeners
//! - Signal-driven teardown

use std::sync::Arc;

use portal::app::App;
use portal::config::Config;
use portal::serve::{control_service, file_service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  Portal - Programmable Edge Serving Layer");
    log::info!("  Version: {}", portal::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");

    let config = Config::from_env();
    log::info!("data plane: {}", config.addr);
    log::info!("control plane: {}", config.ctrl_addr);
    log::info!("upstream store: {}", config.file_addr);

    let db = sled::open(&config.db_path)?;
    let app = App::new(config, db)?;
    app.spawn_background();

    {
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = control_service::serve(app).await {
                log::error!("control service: {}", err);
            }
        });
    }

    {
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = file_service::serve(app).await {
                log::error!("file service: {}", err);
            }
        });
    }

    shutdown_signal().await;

    log::info!("shutting down");
    flush_db(&app);
    log::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("signal handler: {}", err);
    }
}

fn flush_db(app: &Arc<App>) {
    if let Err(err) = app.db.flush() {
        log::error!("flush db: {}", err);
    }
}
