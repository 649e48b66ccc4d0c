use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use rusqlite::Connection;

use courier_agent::executor::{TurnDeps, TurnExecutor};
use courier_agent::{LlmProvider, Tool};
use courier_approvals::engine::ApprovalEngine;
use courier_audit::AuditChain;
use courier_core::config::CourierConfig;
use courier_kv::{KvStore, MemoryKv};
use courier_limits::RateLimiter;
use courier_queue::QueueStore;
use courier_store::{ConversationStore, PreferenceStore, UpdateStore};
use courier_transport::ChatTransport;

use crate::ingest::Ingestor;

/// Central shared state, constructed once at startup and passed as
/// Arc<Services> to HTTP handlers and queue workers. Initialization order
/// is explicit; there are no module-level singletons.
pub struct Services {
    pub config: CourierConfig,
    pub kv: Arc<dyn KvStore>,
    pub updates: Arc<UpdateStore>,
    pub sessions: Arc<ConversationStore>,
    pub prefs: Arc<PreferenceStore>,
    pub audit: Arc<AuditChain>,
    pub queue: Arc<QueueStore>,
    pub approvals: Arc<ApprovalEngine>,
    pub limiter: RateLimiter,
    pub transport: Arc<dyn ChatTransport>,
    pub executor: TurnExecutor,
    pub ingestor: Arc<Ingestor>,
}

impl Services {
    /// Wire every subsystem against one SQLite file. Each store gets its
    /// own connection so subsystem locks never contend with each other.
    pub fn new(
        config: CourierConfig,
        transport: Arc<dyn ChatTransport>,
        primary: Arc<dyn LlmProvider>,
        fallback: Option<Arc<dyn LlmProvider>>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> anyhow::Result<Arc<Self>> {
        let open = || Connection::open(&config.database.path);

        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let updates = Arc::new(UpdateStore::new(open()?)?);
        let sessions = Arc::new(ConversationStore::new(open()?)?);
        let prefs = Arc::new(PreferenceStore::new(open()?)?);
        let audit = Arc::new(AuditChain::new(open()?)?);
        let queue = Arc::new(QueueStore::new(open()?)?);
        let approvals = Arc::new(ApprovalEngine::new(
            open()?,
            Arc::clone(&kv),
            Arc::clone(&audit),
            Arc::clone(&queue),
        )?);
        let limiter = RateLimiter::new(Arc::clone(&kv), config.limits.clone());
        let ingestor = Arc::new(Ingestor::new(Arc::clone(&updates), Arc::clone(&queue)));

        let executor = TurnExecutor::new(TurnDeps {
            kv: Arc::clone(&kv),
            sessions: Arc::clone(&sessions),
            approvals: Arc::clone(&approvals),
            audit: Arc::clone(&audit),
            primary,
            fallback,
            tools,
        });

        Ok(Arc::new(Self {
            config,
            kv,
            updates,
            sessions,
            prefs,
            audit,
            queue,
            approvals,
            limiter,
            transport,
            executor,
            ingestor,
        }))
    }
}

/// Assemble the full Axum router.
pub fn build_router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/healthz", get(crate::http::health::healthz))
        .route("/readyz", get(crate::http::health::readyz))
        .route("/webhook", post(crate::http::webhook::webhook_handler))
        .route(
            "/webhook/{secret}",
            post(crate::http::webhook::webhook_handler_with_secret),
        )
        .route(
            "/internal/replay-update",
            post(crate::http::replay::replay_update),
        )
        .with_state(services)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
