// src/api.rs
//! Read-only diagnostics endpoints.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::metrics::Metrics;
use crate::poller::CursorBoard;

#[derive(Clone)]
pub struct AppState {
    pub cursors: CursorBoard,
    /// Present when some rule uses a link-list feed.
    pub seen_count: Option<Arc<AtomicUsize>>,
}

pub fn router(state: AppState, metrics: Option<&Metrics>) -> Router {
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/debug/cursors", get(debug_cursors))
        .route("/debug/seen", get(debug_seen))
        .with_state(state);
    let app = match metrics {
        Some(m) => app.merge(m.router()),
        None => app,
    };
    app.layer(CorsLayer::very_permissive())
}

async fn debug_cursors(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.cursors.snapshot())
}

#[derive(Serialize)]
struct SeenOut {
    enabled: bool,
    links: usize,
}

async fn debug_seen(State(state): State<AppState>) -> Json<SeenOut> {
    Json(match &state.seen_count {
        Some(c) => SeenOut {
            enabled: true,
            links: c.load(Ordering::Relaxed),
        },
        None => SeenOut {
            enabled: false,
            links: 0,
        },
    })
}
