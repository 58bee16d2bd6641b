//! Application setup: wires the `link-analyser` capability traits to this server's concrete
//! infrastructure and assembles the HTTP router.
//!
//! There is no GraphQL schema, auth middleware, or rate limiter here — request routing and
//! auth around these endpoints are external collaborators the core doesn't implement (spec §1
//! "out of scope"). This is the minimal producer/observer surface the spec describes: a batch
//! ingress endpoint and an SSE stream per project.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use link_analyser::analyser::proxy::HttpRenderProxy;
use link_analyser::analyser::render::HttpRenderEngine;
use link_analyser::{Analyser, AnalyserConfig, PriorityQueue, Repository, Scheduler};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::domains::links::{PostgresLinkRepository, PostgresQueue, StreamHubNotifier};
use crate::kernel::{ServerKernel, StreamHub};
use crate::server::routes::{enqueue_batch, health_handler, stream_handler};

#[derive(Clone)]
pub struct AxumAppState {
    pub db_pool: PgPool,
    pub stream_hub: StreamHub,
    pub repository: Arc<dyn Repository>,
    pub queue: Arc<dyn PriorityQueue>,
    pub notifier: Arc<dyn link_analyser::Notifier>,
}

/// Everything `main` needs to drive the long-running pieces once the router is serving.
pub struct AppHandles {
    pub worker_pool: Arc<link_analyser::WorkerPool>,
    pub scheduler: Arc<Scheduler>,
    pub repository: Arc<dyn Repository>,
}

/// Assembles the router and the background-task handles sharing its state.
///
/// `render_proxy_token` enables the proxy-fallback strategy (spec §4.3 step 5) when present;
/// without it the analyser only ever attempts the direct render engine.
pub fn build_app(
    db_pool: PgPool,
    worker_concurrency: usize,
    render_proxy_token: Option<String>,
) -> (Router, AppHandles) {
    let stream_hub = StreamHub::new();
    let kernel = Arc::new(ServerKernel::new(db_pool.clone(), stream_hub.clone()));

    let repository: Arc<dyn Repository> = Arc::new(PostgresLinkRepository::new(kernel.clone()));
    let queue: Arc<dyn PriorityQueue> = Arc::new(PostgresQueue::new(kernel.clone()));
    let notifier: Arc<dyn link_analyser::Notifier> =
        Arc::new(StreamHubNotifier::new(stream_hub.clone()));

    let render_proxy: Option<Arc<dyn link_analyser::analyser::proxy::RenderProxy>> =
        render_proxy_token
            .map(|token| {
                Arc::new(HttpRenderProxy::new(
                    "https://api.render-proxy.internal",
                    Some(token),
                )) as Arc<dyn link_analyser::analyser::proxy::RenderProxy>
            });
    let analyser = Arc::new(Analyser::new(
        Arc::new(HttpRenderEngine::default()),
        render_proxy,
        AnalyserConfig::default(),
    ));

    let worker_pool = Arc::new(link_analyser::WorkerPool::new(
        queue.clone(),
        repository.clone(),
        notifier.clone(),
        analyser,
        worker_concurrency,
    ));

    let sheet_adapter: Arc<dyn link_analyser::SheetAdapter> =
        Arc::new(link_analyser::sheet_adapter::HttpSheetAdapter::new(
            "https://sheets.googleapis.com/v4/spreadsheets",
            std::env::var("SHEETS_API_TOKEN").unwrap_or_default(),
        ));
    let scheduler = Arc::new(Scheduler::new(
        repository.clone(),
        queue.clone(),
        notifier.clone(),
        sheet_adapter,
    ));

    let state = AxumAppState {
        db_pool,
        stream_hub,
        repository,
        queue,
        notifier,
    };

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/api/projects/:project_id/batch", post(enqueue_batch))
        .route("/api/projects/:project_id/stream", get(stream_handler))
        .layer(Extension(state.clone()))
        .layer(TraceLayer::new_for_http());

    (
        router,
        AppHandles {
            worker_pool,
            scheduler,
            repository: state.repository,
        },
    )
}
