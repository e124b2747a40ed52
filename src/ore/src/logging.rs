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

//! Structured logging setup shared by `uncloudd` and `uncloud`.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

/// A handle that lets the internal HTTP server adjust the log filter at
/// runtime (see [`crate::http::handle_reload_log_filter`]).
#[derive(Clone)]
pub struct TracingHandle {
    filter: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl TracingHandle {
    /// Replaces the active `EnvFilter` with one parsed from `directives`.
    pub fn reload_filter(&self, directives: &str) -> Result<(), anyhow::Error> {
        let filter = EnvFilter::try_new(directives)?;
        self.filter.reload(filter)?;
        Ok(())
    }
}

/// Initializes the global `tracing` subscriber: an `EnvFilter` seeded from
/// `default_directives` (overridable via `UNCLOUD_LOG_FILTER`) feeding an
/// ANSI-colored `fmt` layer on stderr.
///
/// Call once, at the top of `main`. Returns a [`TracingHandle`] for runtime
/// filter changes, e.g. via the internal `/api/logging/config` endpoint.
pub fn init_logging(default_directives: &str) -> Result<TracingHandle, anyhow::Error> {
    let env_filter = EnvFilter::try_from_env("UNCLOUD_LOG_FILTER")
        .unwrap_or_else(|_| EnvFilter::new(default_directives))
        .add_directive(LevelFilter::INFO.into());
    let (filter_layer, reload_handle) = reload::Layer::new(env_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    Ok(TracingHandle {
        filter: reload_handle,
    })
}
