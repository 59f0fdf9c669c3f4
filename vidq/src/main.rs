use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use vidq::config::AppConfig;
use vidq::database;
use vidq::queue::{AddRequest, QueueEvent};
use vidq::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    let logging =
        vidq::logging::init_logging(config.log_dir.as_deref(), config.log_filter.as_deref())?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    info!(database = %config.database_url, "Database ready");

    let container = ServiceContainer::new(config, pool).await?;
    logging.start_retention_cleanup(container.cancellation_token());
    container.initialize().await?;

    let mut events = container.queue.subscribe();
    let cancel = container.cancellation_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(QueueEvent::Progress { .. }) => {}
                    Ok(event) => info!("{}", event.description()),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event log lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    for url in std::env::args().skip(1) {
        let response = container.queue.add(&url, AddRequest::default()).await;
        match (response.is_ok(), response.msg) {
            (true, msg) => info!(url, msg = msg.as_deref().unwrap_or(""), "Added"),
            (false, msg) if response.hidden => info!(url, msg = msg.as_deref().unwrap_or(""), "Skipped"),
            (false, msg) => error!(url, msg = msg.as_deref().unwrap_or(""), "Failed to add"),
        }
    }

    info!("vidq running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    container.shutdown().await;
    Ok(())
}
