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

//! `uncloud`'s command-line surface. Deliberately minimal: the full
//! operator command surface is out of scope (spec §1 Non-goals), so this
//! only carries enough to demonstrate the fan-out proxy (§4.1) and drive
//! the ordered log-merge engine (§4.3) end to end.

use std::path::PathBuf;

/// The operator-facing client. Talks to whichever machine's `uncloudd` it
/// is pointed at; that machine's `Director` transparently fans calls out
/// to peers per the `--machine`/`--machines` flags below.
#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "uncloud")]
pub struct Args {
    /// This machine's stable cluster-wide ID, used to tell the ordered
    /// log-merge engine which replicas it can reach over the local domain
    /// socket instead of the overlay network (§4.1 "Backend resolution").
    #[clap(long, env = "UNCLOUD_MACHINE_ID")]
    pub machine_id: String,

    /// Directory holding the local `uncloudd`'s state: its machine
    /// database and domain sockets. The CLI is assumed to run alongside a
    /// daemon on the same host, matching "operators interact with any
    /// single machine via a command-line client" (spec §1).
    #[clap(long, env = "UNCLOUD_DATA_DIR", default_value = "/var/lib/uncloud")]
    pub data_dir: PathBuf,

    /// TCP port every peer's overlay address is dialed on.
    #[clap(long, env = "UNCLOUD_RPC_OVERLAY_PORT", default_value = "7070")]
    pub rpc_overlay_port: u16,

    #[clap(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn machine_db_path(&self) -> PathBuf {
        self.data_dir.join("machine.db")
    }

    pub fn public_socket_path(&self) -> PathBuf {
        self.data_dir.join("uncloud.sock")
    }

    pub fn local_service_socket_path(&self) -> PathBuf {
        self.data_dir.join("local.sock")
    }
}

/// Which machine(s) a fan-out-capable call targets. Mirrors the metadata
/// keys of §4.1/§6 directly: at most one of these is meaningful per call,
/// and `machines` (including its `"*"` wildcard) always wins over `machine`
/// per the convention `rpc::Director` inherits from §9 Design Notes.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Dispatch to exactly one named machine (§4.1 rule 3).
    #[clap(long, conflicts_with = "machines")]
    pub machine: Option<String>,

    /// Dispatch to every machine in this comma-separated list, or to every
    /// cluster member if the list is exactly `*` (§4.1 rule 4).
    #[clap(long)]
    pub machines: Option<String>,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Lists running services, merging replies from every targeted
    /// machine into one table (demonstrates the fan-out proxy, §4.1).
    ListServices {
        #[clap(flatten)]
        target: TargetArgs,
    },
    /// Inspects a local Docker image by name or ID on the targeted
    /// machine(s).
    InspectImage {
        name: String,
        #[clap(flatten)]
        target: TargetArgs,
    },
    /// Streams and merges a service's container logs across every
    /// replica, on every targeted machine (§4.3).
    Logs {
        service: String,
        #[clap(flatten)]
        target: TargetArgs,
        /// `fast` prints as entries arrive with no cross-machine ordering
        /// guarantee; `strict` merges every machine's stream into a single
        /// non-decreasing-timestamp order at the cost of lockstep pacing.
        #[clap(long, arg_enum, default_value = "fast")]
        order: OrderMode,
    },
}

#[derive(clap::ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    /// §4.3 fast mode: arrival order, no cross-machine guarantee.
    Fast,
    /// §4.3 strict mode: a k-way merge in non-decreasing timestamp order.
    Strict,
}

impl From<OrderMode> for uncloud_logs::engine::MergeMode {
    fn from(mode: OrderMode) -> Self {
        match mode {
            OrderMode::Fast => uncloud_logs::engine::MergeMode::Fast,
            OrderMode::Strict => uncloud_logs::engine::MergeMode::Strict,
        }
    }
}
