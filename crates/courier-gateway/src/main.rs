use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use courier_agent::anthropic::AnthropicProvider;
use courier_agent::{LlmProvider, Tool};
use courier_core::config::{CourierConfig, RunMode};
use courier_gateway::{app, poller, workers};
use courier_transport::client::BotClient;
use courier_transport::ChatTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_gateway=info,tower_http=debug".into()),
        )
        .init();

    // Config: explicit path via COURIER_CONFIG > ~/.courier/courier.toml.
    // Invalid config is fatal; the process exits non-zero.
    let config_path = std::env::var("COURIER_CONFIG").ok();
    let config = CourierConfig::load(config_path.as_deref())?;

    let bot = Arc::new(BotClient::new(
        &config.transport.token,
        config.transport.api_base.as_deref(),
    ));
    let transport: Arc<dyn ChatTransport> = bot.clone();

    let Some(anthropic) = config.providers.anthropic.clone() else {
        anyhow::bail!("providers.anthropic must be configured");
    };
    let primary: Arc<dyn LlmProvider> = Arc::new(AnthropicProvider::new(
        anthropic.api_key,
        anthropic.base_url,
    ));
    // The fallback attempt reuses the provider client with the fallback
    // model id from config.
    let fallback = config
        .models
        .fallback
        .is_some()
        .then(|| Arc::clone(&primary));

    // Domain tool catalogs (wallet, chain queries, …) plug in here.
    let tools: Vec<Arc<dyn Tool>> = Vec::new();

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let run_mode = config.transport.mode;
    let public_url = config.transport.public_url.clone();
    let webhook_secret = config.transport.webhook_secret.clone();

    let services = app::Services::new(config, transport, primary, fallback, tools)?;

    // Crash recovery before any worker starts.
    services.queue.recover_running_on_startup()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Queue workers.
    let engine = workers::build_engine(&services);
    let engine_handle = tokio::spawn(engine.run(shutdown_rx.clone()));

    // Recovery sweep, every 5 s from service start.
    let sweep_handle = tokio::spawn(
        Arc::clone(&services.ingestor).sweep_loop(shutdown_rx.clone()),
    );

    // Processed updates are kept 30 days for replay, then purged.
    {
        let services = Arc::clone(&services);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(6 * 3600));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match services.updates.purge_older_than(30) {
                            Ok(n) if n > 0 => info!(purged = n, "purged old processed updates"),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "update purge failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // Transport intake.
    let poll_handle = match run_mode {
        RunMode::Polling => {
            poller::bootstrap(&bot).await?;
            Some(tokio::spawn(poller::run_polling(
                Arc::clone(&services),
                Arc::clone(&bot),
                shutdown_rx.clone(),
            )))
        }
        RunMode::Webhook => {
            match &public_url {
                Some(base) => {
                    let url = format!("{}/webhook", base.trim_end_matches('/'));
                    if let Err(e) = bot.set_webhook(&url, webhook_secret.as_deref()).await {
                        warn!(error = %e, "webhook registration failed; deliveries may not arrive");
                    }
                }
                None => warn!("webhook mode without transport.public_url; register the webhook manually"),
            }
            None
        }
    };

    let router = app::build_router(Arc::clone(&services));
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("courier gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received, draining");
        })
        .await?;

    // Stop intake and workers, then wait for in-flight jobs to drain.
    shutdown_tx.send(true).ok();
    if let Some(handle) = poll_handle {
        handle.await.ok();
    }
    sweep_handle.await.ok();
    engine_handle.await.ok();
    info!("courier gateway stopped");

    Ok(())
}
