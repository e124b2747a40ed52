// Copyright The Uncloud Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Handlers shared by every binary's internal HTTP server (§6 "Metrics/
//! health"): a liveness probe, a Prometheus exposition endpoint, and a
//! runtime log-filter reload endpoint backed by [`crate::logging::TracingHandle`].

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Registry, TextEncoder};

use crate::logging::TracingHandle;

/// `GET /api/livez`: always `200 OK` once the process is far enough along
/// to have mounted this route at all.
pub async fn handle_liveness_check() -> impl IntoResponse {
    (StatusCode::OK, "uncloud is alive and well!")
}

/// `GET /metrics`: renders every metric registered in `registry` in
/// Prometheus's text exposition format.
pub async fn handle_prometheus(registry: Arc<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::error!(%err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::error!(%err, "encoded metrics were not valid UTF-8");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// `PUT /api/logging/config`: replaces the active `EnvFilter` directives
/// with the request body, taken as-is (e.g. `uncloud=debug,info`).
pub async fn handle_reload_log_filter(
    handle: TracingHandle,
    directives: String,
) -> impl IntoResponse {
    match handle.reload_filter(directives.trim()) {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()),
    }
}
