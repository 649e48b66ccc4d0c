//! Pull-mode ingestion: long-poll the platform and feed the pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use courier_transport::client::BotClient;

use crate::app::Services;

const BOOTSTRAP_ATTEMPTS: u32 = 8;
const BOOTSTRAP_BACKOFF_MS: u64 = 750;
const POLL_TIMEOUT_SECS: u64 = 30;

/// Verify the bot token and clear any stale webhook before polling.
/// Linear backoff: 750 ms × attempt. Gives up after eight tries.
pub async fn bootstrap(bot: &BotClient) -> anyhow::Result<()> {
    let mut last_error = String::new();
    for attempt in 1..=BOOTSTRAP_ATTEMPTS {
        match bot.get_me().await {
            Ok(_) => {
                bot.delete_webhook().await.ok();
                info!(attempt, "polling bootstrap complete");
                return Ok(());
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(attempt, error = %e, "polling bootstrap failed, retrying");
                tokio::time::sleep(Duration::from_millis(
                    BOOTSTRAP_BACKOFF_MS * attempt as u64,
                ))
                .await;
            }
        }
    }
    anyhow::bail!("polling bootstrap exhausted retries: {last_error}")
}

/// Long-poll loop. Every polled update goes through the same ingestion
/// contract as a webhook delivery.
pub async fn run_polling(
    services: Arc<Services>,
    bot: Arc<BotClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut offset: i64 = 0;
    info!("polling loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let batch = tokio::select! {
            result = bot.get_updates(offset, POLL_TIMEOUT_SECS) => result,
            _ = shutdown.changed() => continue,
        };

        let updates = match batch {
            Ok(updates) => updates,
            Err(e) => {
                error!(error = %e, "getUpdates failed");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let payload = update.into_payload();
            if let Err(e) = services.ingestor.ingest(&payload) {
                error!(error = %e, "polled update ingest failed");
            }
        }
    }
    info!("polling loop stopped");
}
