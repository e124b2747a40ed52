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

//! `uncloudd`'s command-line surface.

use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;

/// The long-lived per-machine orchestrator process: the RPC proxy, the
/// local container watcher, and the ingress reconciler.
#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "uncloudd")]
pub struct Args {
    /// This machine's stable cluster-wide ID.
    #[clap(long, env = "UNCLOUDD_MACHINE_ID")]
    pub machine_id: String,

    /// This machine's human-readable, cluster-unique name.
    #[clap(long, env = "UNCLOUDD_MACHINE_NAME")]
    pub machine_name: String,

    /// This machine's overlay (WireGuard mesh) address.
    #[clap(long, env = "UNCLOUDD_NETWORK_ADDRESS")]
    pub network_address: Ipv6Addr,

    /// Directory holding this daemon's persistent state: the embedded
    /// machine/container database and the public RPC domain socket.
    #[clap(long, env = "UNCLOUDD_DATA_DIR", default_value = "/var/lib/uncloud")]
    pub data_dir: PathBuf,

    /// TCP port every peer's overlay address is dialed on for proxied RPCs.
    #[clap(long, env = "UNCLOUDD_RPC_OVERLAY_PORT", default_value = "7070")]
    pub rpc_overlay_port: u16,

    /// The address of the internal HTTP server (`/api/livez`, `/metrics`).
    #[clap(
        long,
        env = "UNCLOUDD_INTERNAL_HTTP_LISTEN_ADDR",
        default_value = "127.0.0.1:6878"
    )]
    pub internal_http_listen_addr: SocketAddr,

    /// Directory the rendered Caddyfile is written into.
    #[clap(long, env = "UNCLOUDD_INGRESS_CONFIG_DIR", default_value = "/etc/caddy")]
    pub ingress_config_dir: PathBuf,

    /// Unix domain socket the reverse proxy's admin API listens on.
    #[clap(
        long,
        env = "UNCLOUDD_INGRESS_ADMIN_SOCKET",
        default_value = "/run/caddy/admin.sock"
    )]
    pub ingress_admin_socket_path: PathBuf,

    /// Group the rendered Caddyfile's ownership is set to.
    #[clap(long, env = "UNCLOUDD_INGRESS_CONFIG_GROUP", default_value = "caddy")]
    pub ingress_config_group: String,

    /// How often to check the machine database for membership changes and
    /// flush the Director's remote-backend cache accordingly (§4.1
    /// "Lifecycle": cached backends are closed "on membership changes"; the
    /// membership event stream itself comes from the cluster's gossip/state
    /// store, out of scope here, so this daemon notices changes by polling
    /// the machine table that store is assumed to keep current).
    #[clap(long, env = "UNCLOUDD_MEMBERSHIP_POLL_SECS", default_value = "30")]
    pub membership_poll_secs: u64,

    /// Overrides the Docker client's connection target; unset uses the
    /// platform default (usually `/var/run/docker.sock`).
    #[clap(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,
}

impl Args {
    pub fn machine_db_path(&self) -> PathBuf {
        self.data_dir.join("machine.db")
    }

    /// The public-facing domain socket the CLI and other local clients
    /// connect to; fronted by the `Director`.
    pub fn public_socket_path(&self) -> PathBuf {
        self.data_dir.join("uncloud.sock")
    }

    /// The internal domain socket the real `Uncloud` service implementation
    /// listens on, and that `LocalBackend` dials (§4.1 "Backend
    /// resolution": "the local backend wraps a transport to the local
    /// daemon").
    pub fn local_service_socket_path(&self) -> PathBuf {
        self.data_dir.join("local.sock")
    }
}
