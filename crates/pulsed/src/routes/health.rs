//! Health check and status endpoints.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use pulse_common::TransportSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::cluster::{AdmissionEvent, ClusterStateEntry, Membership};
use crate::relay::SlotInfo;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct StatusResponse {
    nodename: String,
    started_at: DateTime<Utc>,
    heartbeats: Vec<TransportSnapshot>,
    nodes: BTreeMap<String, ClusterStateEntry>,
    members: BTreeMap<String, Membership>,
    admissions: Vec<AdmissionEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    relay_slots: Option<BTreeMap<String, SlotInfo>>,
}

/// Heartbeat and cluster state export
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let relay_slots = match &state.relay_slots {
        Some(slots) => Some(slots.slots().await),
        None => None,
    };

    Json(StatusResponse {
        nodename: state.nodename.clone(),
        started_at: state.started_at,
        heartbeats: state.heartbeats.snapshots().await,
        nodes: state.store.snapshot().await,
        members: state.store.members().await,
        admissions: state.store.admissions().await,
        relay_slots,
    })
}
