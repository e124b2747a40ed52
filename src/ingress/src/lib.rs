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

//! The ingress-configuration reconciler of §4.2: keeps the local reverse
//! proxy's configuration in sync with the set of healthy ingress-exposed
//! containers in the cluster.

pub mod admin;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod render;

pub use admin::CaddyAdminClient;
pub use config::IngressConfig;
pub use error::{ReconcileError, ReverseProxyAdminError};
pub use reconciler::IngressReconciler;
