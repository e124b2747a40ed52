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

use std::path::PathBuf;

/// Fixed paths and identities the reconciler needs (§6 "Reverse-proxy
/// configuration file").
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// The directory the rendered `Caddyfile` is written into.
    pub config_dir: PathBuf,
    /// The Unix domain socket the admin interface listens on.
    pub admin_socket_path: PathBuf,
    /// The group the rendered file's owning group is set to, by name.
    pub config_group: String,
    /// This machine's ID, substituted into the health-check route (§4.2
    /// step 5) and used to find the local `caddy` container (§4.2 step 6).
    pub local_machine_id: String,
}

impl IngressConfig {
    pub fn caddyfile_path(&self) -> PathBuf {
        self.config_dir.join("Caddyfile")
    }
}
