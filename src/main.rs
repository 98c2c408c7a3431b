use std::sync::Arc;

use tokio::{signal, sync::mpsc};
use tracing::{error, info};

use storefront_core as storefront;
use storefront::jobs::Scheduler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = storefront::config::load_config()?;
    storefront::config::init_tracing(&cfg.log_level, cfg.log_json);

    info!(environment = %cfg.environment, "Starting storefront-core");

    let db_pool = storefront::db::establish_connection_from_app_config(&cfg).await?;
    storefront::db::check_connection(&db_pool).await?;
    if cfg.auto_migrate {
        storefront::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(storefront::events::EventSender::new(event_tx));
    let event_task = tokio::spawn(storefront::events::process_events(event_rx));

    let scheduler = storefront::jobs::TokioScheduler::new();
    let ctx = storefront::jobs::JobContext::from_config(db.clone(), event_sender.clone(), &cfg);
    info!(
        expiry_every_secs = ctx.expiry_interval.as_secs(),
        auto_confirm_every_secs = ctx.auto_confirm_interval.as_secs(),
        "Starting order lifecycle jobs"
    );
    storefront::jobs::start(&scheduler, ctx);

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.shutdown().await;

    // The processor exits once the last sender is gone.
    drop(event_sender);
    if let Err(e) = event_task.await {
        error!("Event processor ended abnormally: {}", e);
    }

    match Arc::try_unwrap(db) {
        Ok(pool) => {
            if let Err(e) = storefront::db::close_pool(pool).await {
                error!("Failed to close database pool: {}", e);
            }
        }
        Err(_) => info!("Database pool still shared by a running task, leaving it to drop"),
    }

    info!("storefront-core stopped");
    Ok(())
}
