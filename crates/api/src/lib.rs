//! Read-only HTTP view of the store.
//!
//! `GET /deployments` answers from the local cache only and never waits for
//! the first list; before the reflector has synced it simply returns `[]`.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use corral_core::columns::desired_replicas;
use corral_core::ObjectRecord;
use corral_store::IndexedStore;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEPLOYMENT_KIND: &str = "Deployment";

/// Simplified deployment row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentSummary {
    pub name: String,
    pub namespace: String,
    pub replicas: u64,
    pub ready: u64,
}

impl DeploymentSummary {
    pub fn from_record(rec: &ObjectRecord) -> Self {
        Self {
            name: rec.key.name.clone(),
            namespace: rec.key.namespace.clone().unwrap_or_default(),
            replicas: desired_replicas(&rec.raw),
            ready: rec.raw.pointer("/status/readyReplicas").and_then(|v| v.as_u64()).unwrap_or(0),
        }
    }
}

/// Current deployments in the store, sorted by namespace then name.
pub fn deployment_summaries(store: &IndexedStore) -> Vec<DeploymentSummary> {
    let mut out: Vec<DeploymentSummary> = store
        .list_filtered(|r| r.key.kind == DEPLOYMENT_KIND && !r.deleted)
        .iter()
        .map(|r| DeploymentSummary::from_record(r))
        .collect();
    out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    out
}

async fn list_deployments(State(store): State<IndexedStore>) -> Json<Vec<DeploymentSummary>> {
    counter!("api_requests_total", 1u64);
    let rows = deployment_summaries(&store);
    debug!(count = rows.len(), synced = store.has_synced(), "serving deployments");
    Json(rows)
}

/// Router over `store`. Methods other than GET on a known path get 405.
pub fn router(store: IndexedStore) -> Router {
    Router::new().route("/deployments", get(list_deployments)).with_state(store)
}

/// Serve on `addr` until `shutdown` fires.
pub async fn serve(store: IndexedStore, addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("api stopped");
    Ok(())
}
