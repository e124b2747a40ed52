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

//! The daemon's internal HTTP server (§6 "Metrics/health"), assembled from
//! `uncloud_ore::http`'s shared handlers the same way `clusterd` assembles
//! its own.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing;
use prometheus::Registry;

use uncloud_ore::http::{handle_liveness_check, handle_prometheus, handle_reload_log_filter};
use uncloud_ore::logging::TracingHandle;

pub async fn serve(
    listen_addr: SocketAddr,
    registry: Arc<Registry>,
    tracing_handle: TracingHandle,
) -> Result<(), anyhow::Error> {
    let router = axum::Router::new()
        .route("/api/livez", routing::get(handle_liveness_check))
        .route(
            "/metrics",
            routing::get(move || {
                let registry = Arc::clone(&registry);
                async move { handle_prometheus(registry).await }
            }),
        )
        .route(
            "/api/logging/config",
            routing::put(move |body: String| {
                let tracing_handle = tracing_handle.clone();
                async move { handle_reload_log_filter(tracing_handle, body).await }
            }),
        );

    tracing::info!(%listen_addr, "serving internal HTTP server");
    axum::Server::bind(&listen_addr)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
