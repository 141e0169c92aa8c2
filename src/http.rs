//! Read-only introspection endpoints
//!
//! Runs on its own runtime so a slow client never competes with ingestion.
//! Every response closes the connection.

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::filter::ring::RECENT_CAPACITY;
use crate::filter::{DexFilter, FilterRegistry, SwapFilter};
use crate::notify::NotificationDispatcher;
use crate::source::SourceManager;
use crate::storage::StorageEngine;

const DEFAULT_RECENT: usize = 10;

pub struct AppState {
    pub sources: Arc<SourceManager>,
    pub filters: Arc<FilterRegistry>,
    pub dex: Option<Arc<DexFilter>>,
    pub swap: Option<Arc<SwapFilter>>,
    pub notifier: Arc<NotificationDispatcher>,
    pub storage: Arc<StorageEngine>,
    requests: AtomicU64,
}

impl AppState {
    pub fn new(
        sources: Arc<SourceManager>,
        filters: Arc<FilterRegistry>,
        dex: Option<Arc<DexFilter>>,
        swap: Option<Arc<SwapFilter>>,
        notifier: Arc<NotificationDispatcher>,
        storage: Arc<StorageEngine>,
    ) -> Self {
        Self {
            sources,
            filters,
            dex,
            swap,
            notifier,
            storage,
            requests: AtomicU64::new(0),
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

type Shared = Arc<AppState>;

pub fn router(state: Shared) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/recent_dex", get(recent_dex))
        .route("/recent_swaps", get(recent_swaps))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
}

async fn count_requests(State(state): State<Shared>, request: Request, next: Next) -> Response {
    state.requests.fetch_add(1, Ordering::Relaxed);
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

async fn health(State(state): State<Shared>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "requests": state.requests(),
    }))
}

async fn stats(State(state): State<Shared>) -> Json<Value> {
    Json(json!({
        "data_sources": state.sources.stats(),
        "filters": state.filters.stats(),
        "notifications": {
            "enabled": state.notifier.notifications_enabled(),
            "plugins": state.notifier.stats(),
        },
        "storage": {
            "total_transactions": state.storage.total_stored_transactions(),
            "total_batches": state.storage.total_batches(),
        },
    }))
}

/// Missing or unparsable falls back to the default; capped at the ring size
fn recent_limit(params: &HashMap<String, String>) -> usize {
    params
        .get("max")
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_RECENT)
        .min(RECENT_CAPACITY)
}

async fn recent_dex(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let max = recent_limit(&params);
    let matches = state.dex.as_ref().map(|f| f.recent(max)).unwrap_or_default();
    Json(json!(matches))
}

async fn recent_swaps(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let max = recent_limit(&params);
    let swaps = state.swap.as_ref().map(|f| f.recent(max)).unwrap_or_default();
    Json(json!(swaps))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: Shared, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Http(e.to_string()))
}

/// HTTP server on a dedicated multi-thread runtime
pub struct HttpServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HttpServer {
    /// Binds synchronously so a taken port surfaces here
    pub fn start(port: u16, threads: usize, state: Shared) -> Result<Self> {
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("http-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(threads.max(1))
                    .thread_name("http-worker")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build HTTP runtime: {}", e);
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!("Failed to register HTTP listener: {}", e);
                            return;
                        }
                    };
                    let stop = async {
                        let _ = signal.await;
                    };
                    if let Err(e) = serve(listener, state, stop).await {
                        error!("HTTP server error: {}", e);
                    }
                });
            })?;

        info!("HTTP server listening on {} with {} threads", addr, threads.max(1));

        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Blocks until in-flight requests finish
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("HTTP server thread panicked");
            }
            info!("HTTP server stopped");
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
