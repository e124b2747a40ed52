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

//! The data model of §3: machines, containers, and the opaque service
//! specification they carry.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::label::{self, Port};

/// Identity of a cluster member. `(id, name)` are unique cluster-wide;
/// `network_address` is the machine's overlay (WireGuard mesh) address,
/// routable from every other member. Created on join, mutated only by
/// membership events, destroyed on departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: String,
    pub name: String,
    pub network_address: Ipv6Addr,
}

/// A resolved `{id, name, addr}` triple produced by [`crate::MachineMapper`]
/// for one specific RPC dispatch. Derived, short-lived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineTarget {
    pub id: String,
    pub name: String,
    pub addr: Ipv6Addr,
}

impl From<MachineInfo> for MachineTarget {
    fn from(info: MachineInfo) -> Self {
        MachineTarget {
            id: info.id,
            name: info.name,
            addr: info.network_address,
        }
    }
}

/// The user-declared specification of a service. Its shape is a Non-goal of
/// this system (it flows through Docker container creation, which is out of
/// scope) — it is stored and echoed back opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceSpec(pub serde_json::Value);

/// Runtime state of one container, as last observed by the Docker-event
/// watcher on the machine that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub running: bool,
    pub health_known: bool,
    pub healthy: bool,
    pub network_address: Option<Ipv6Addr>,
    pub created_unix_nanos: i64,
    pub labels: BTreeMap<String, String>,
    pub spec: ServiceSpec,
}

impl Container {
    /// Spec §4.2 step 2's health predicate: a container counts as an
    /// ingress backend only once it is both running and has reported
    /// healthy (or carries no health check at all, in which case "running"
    /// is as healthy as it gets).
    pub fn is_healthy(&self) -> bool {
        self.running && (!self.health_known || self.healthy)
    }

    /// Parses this container's `uncloud.service.ports` label, if present.
    pub fn ports(&self) -> Result<Vec<Port>, label::ParseError> {
        match self.labels.get(label::PORTS_LABEL) {
            Some(value) => label::parse_ports(value),
            None => Ok(Vec::new()),
        }
    }

    /// The container's custom reverse-proxy config block, if it declared
    /// one via `uncloud.ingress.custom-config`.
    pub fn custom_config(&self) -> Option<&str> {
        self.labels
            .get(label::CUSTOM_CONFIG_LABEL)
            .map(String::as_str)
    }

    /// Whether this container is eligible for orchestrator-driven cleanup
    /// (§6: the `uncloud.managed` label).
    pub fn is_managed(&self) -> bool {
        self.labels
            .get(label::MANAGED_LABEL)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// A `{machine_id, container}` tuple as kept in the cluster store. Mutated
/// only by the Docker-event watcher on the owning machine; read by every
/// [`crate::Store`] consumer, notably every IngressReconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub machine_id: String,
    pub container: Container,
}
