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

//! Errors distinguishing "the reverse proxy is unreachable" (§4.2 step 8
//! degrade path) from "the reverse proxy rejected this config" (§4.2 steps
//! 6-7 validation path), plus the reconciler's own internal error type.

use thiserror::Error;

/// Returned by [`crate::admin::CaddyAdminClient`]. The two variants drive
/// two different branches of the reconcile algorithm and must not be
/// conflated.
#[derive(Debug, Error)]
pub enum ReverseProxyAdminError {
    /// The admin socket could not be dialed, or the request timed out.
    /// Triggers §4.2 step 8's "unreachable" branch.
    #[error("reverse proxy admin interface unreachable: {0}")]
    Unreachable(String),
    /// The admin interface answered with a non-2xx status and a body
    /// describing why the candidate was rejected. Triggers the
    /// validation-failure path (§4.2 steps 6-7).
    #[error("reverse proxy rejected configuration: {0}")]
    Rejected(String),
}

/// Internal reconciler errors. Per §7, `ValidationFailed` never crosses any
/// RPC boundary: it is logged and the offending block is skipped, never
/// returned from [`crate::reconciler::IngressReconciler::run`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to enumerate container inventory: {0}")]
    Inventory(#[source] anyhow::Error),
    #[error("failed to render configuration template: {0}")]
    Render(#[from] askama::Error),
    #[error("failed to write configuration file: {0}")]
    Io(#[source] std::io::Error),
    #[error("failed to set configuration file ownership: {0}")]
    Ownership(#[source] nix::Error),
    #[error("custom config block for {service:?} failed validation: {reason}")]
    ValidationFailed { service: String, reason: String },
}
