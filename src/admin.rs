//! Admin HTTP endpoint.
//!
//! Runs on its own listener, separate from the echo port:
//! - `GET /health`: liveness, always `OK`
//! - `GET /debug/vars`: JSON snapshot of the connection counters
//!
//! Read-only: nothing here can change server state.

use crate::admission::AdmissionGate;
use crate::stats::{Stats, StatsSnapshot};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AdminState {
    pub stats: Arc<Stats>,
    pub gate: AdmissionGate,
}

#[derive(Debug, Serialize)]
pub struct Vars {
    #[serde(flatten)]
    pub counters: StatsSnapshot,
    pub admission_capacity: usize,
    pub admission_available: usize,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/debug/vars", get(vars))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn vars(State(state): State<AdminState>) -> Json<Vars> {
    Json(Vars {
        counters: state.stats.snapshot(),
        admission_capacity: state.gate.capacity(),
        admission_available: state.gate.available(),
    })
}

/// Serve the admin endpoint until it fails.
///
/// Failures are logged and end only the admin task; the echo server keeps
/// running without it.
pub async fn serve(addr: String, state: AdminState) {
    let listener = match TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %addr, error = %e, "Failed to bind admin endpoint");
            return;
        }
    };
    info!(address = %addr, "Admin endpoint listening");

    if let Err(e) = axum::serve(listener, router(state)).await {
        error!(error = %e, "Admin endpoint stopped");
    }
}
