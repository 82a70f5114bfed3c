//! Relay slot service endpoint.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use pulse_common::constants::headers;
use pulse_common::{RelayRequest, RelayResponse};

use crate::relay::status;
use crate::state::AppState;

fn header<'a>(map: &'a HeaderMap, name: &str) -> &'a str {
    map.get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Serve `relay_tx` / `relay_rx` for authenticated cluster nodes
pub async fn relay(
    State(state): State<AppState>,
    header_map: HeaderMap,
    Json(request): Json<RelayRequest>,
) -> (StatusCode, Json<RelayResponse>) {
    let Some(slots) = &state.relay_slots else {
        return (
            StatusCode::NOT_FOUND,
            Json(RelayResponse::error(status::BAD_REQUEST, "relay service disabled")),
        );
    };

    let requester = header(&header_map, headers::X_NODE_NAME);
    if !slots.authorize(header(&header_map, headers::X_RELAY_SECRET)) {
        tracing::warn!(requester = %requester, action = request.action(), "Relay request with bad secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(RelayResponse::error(status::UNAUTHORIZED, "bad secret")),
        );
    }

    let response = slots.handle(requester, request).await;
    let code = if response.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };

    (code, Json(response))
}
