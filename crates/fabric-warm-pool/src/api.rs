use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::entry::{
    ClaimRequest, ClaimedInstance, CleanupReport, FailedUpdate, PrewarmOutcome, PrewarmRequest,
    ReadyUpdate, WarmPoolEntry,
};
use crate::errors::PoolResult;
use crate::provisioner::Provisioner;
use crate::store::WarmPool;

#[derive(Clone)]
pub struct AppState {
    pool: Arc<WarmPool>,
    provisioner: Option<Provisioner>,
}

impl AppState {
    /// Entries are created but provisioning is left to an external caller of the callbacks.
    pub fn callbacks_only(pool: Arc<WarmPool>) -> Self {
        Self {
            pool,
            provisioner: None,
        }
    }

    pub fn with_provisioner(provisioner: Provisioner) -> Self {
        Self {
            pool: provisioner.pool().clone(),
            provisioner: Some(provisioner),
        }
    }

    pub fn claim(&self, request: &ClaimRequest) -> Option<ClaimedInstance> {
        match &self.provisioner {
            Some(provisioner) => provisioner.claim(request),
            None => self.pool.claim_instance(request),
        }
    }

    /// Remove stale entries, stopping instances this process launched for them.
    pub async fn cleanup(&self) -> CleanupReport {
        match &self.provisioner {
            Some(provisioner) => provisioner.reap().await,
            None => self.pool.cleanup_stale_entries(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/prewarm", post(prewarm))
        .route("/claim", post(claim))
        .route("/entries", get(list_entries))
        .route("/entries/{id}/ready", post(mark_ready))
        .route("/entries/{id}/failed", post(mark_failed))
        .route("/cleanup", post(cleanup))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn prewarm(
    State(state): State<AppState>,
    Json(request): Json<PrewarmRequest>,
) -> PoolResult<(StatusCode, Json<PrewarmOutcome>)> {
    let outcome = match &state.provisioner {
        Some(provisioner) => provisioner.prewarm(request)?,
        None => state.pool.create_prewarm_entry(request)?,
    };
    let status = if outcome.already_exists {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

async fn claim(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> Json<Option<ClaimedInstance>> {
    Json(state.claim(&request))
}

async fn list_entries(State(state): State<AppState>) -> Json<Vec<WarmPoolEntry>> {
    Json(state.pool.entries())
}

async fn mark_ready(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ReadyUpdate>,
) -> StatusCode {
    state.pool.mark_instance_ready(&id, update);
    StatusCode::NO_CONTENT
}

async fn mark_failed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<FailedUpdate>,
) -> StatusCode {
    state.pool.mark_instance_failed(&id, update.error_message);
    StatusCode::NO_CONTENT
}

async fn cleanup(State(state): State<AppState>) -> Json<CleanupReport> {
    Json(state.cleanup().await)
}
