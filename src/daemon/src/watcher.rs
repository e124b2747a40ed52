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

//! Keeps this machine's slice of the container inventory (§3
//! `ContainerRecord`) in sync with the local Docker daemon — the "external
//! collaborator...treated as a black-box container runtime reached by a
//! local client library" of spec.md §1. Every managed container's labels
//! (§6) are translated into a `ContainerRecord` and upserted on every
//! lifecycle event Docker reports; a container that disappears is removed.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::sync::Arc;

use bollard::container::ListContainersOptions;
use bollard::models::ContainerStateStatusEnum;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use uncloud_machine::label::MANAGED_LABEL;
use uncloud_machine::{Container, ContainerRecord, ServiceSpec, Store};

/// Runs until `cancellation` fires. Does an initial full resync, then
/// applies Docker's container lifecycle events as they arrive.
pub async fn run<S>(
    docker: Docker,
    store: Arc<S>,
    machine_id: String,
    cancellation: CancellationToken,
) where
    S: Store,
{
    if let Err(err) = resync(&docker, &store, &machine_id).await {
        tracing::error!(%err, "initial container inventory resync failed");
    }

    let mut filters = std::collections::HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    let mut events = docker.events(Some(EventsOptions::<String> {
        filters,
        ..Default::default()
    }));

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                tracing::info!("container watcher shutting down");
                return;
            }
            event = events.next() => {
                match event {
                    Some(Ok(event)) => handle_event(&docker, &store, &machine_id, event).await,
                    Some(Err(err)) => {
                        tracing::warn!(%err, "docker event stream error");
                    }
                    None => {
                        tracing::warn!("docker event stream ended; resyncing");
                        if let Err(err) = resync(&docker, &store, &machine_id).await {
                            tracing::error!(%err, "container inventory resync after stream end failed");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_event<S>(docker: &Docker, store: &Arc<S>, machine_id: &str, event: bollard::models::EventMessage)
where
    S: Store,
{
    let Some(actor) = event.actor else { return };
    let Some(container_id) = actor.id else { return };
    let action = event.action.as_deref().unwrap_or_default();

    if action == "destroy" {
        if let Err(err) = store.remove_container(&container_id).await {
            tracing::warn!(%err, container_id, "failed to remove container record");
        }
        return;
    }

    match upsert_from_inspect(docker, store, machine_id, &container_id).await {
        Ok(()) => {}
        Err(err) => {
            tracing::warn!(%err, container_id, "failed to refresh container record");
        }
    }
}

async fn resync<S>(docker: &Docker, store: &Arc<S>, machine_id: &str) -> Result<(), anyhow::Error>
where
    S: Store,
{
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        }))
        .await?;

    for summary in containers {
        let Some(id) = summary.id else { continue };
        if let Err(err) = upsert_from_inspect(docker, store, machine_id, &id).await {
            tracing::warn!(%err, container_id = %id, "failed to record container during resync");
        }
    }
    Ok(())
}

async fn upsert_from_inspect<S>(
    docker: &Docker,
    store: &Arc<S>,
    machine_id: &str,
    container_id: &str,
) -> Result<(), anyhow::Error>
where
    S: Store,
{
    let inspect = docker.inspect_container(container_id, None).await?;

    let labels: BTreeMap<String, String> = inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();

    // Only containers this orchestrator manages (§6 `uncloud.managed`)
    // participate in the inventory; anything else on the host is none of
    // this daemon's business.
    if labels.get(MANAGED_LABEL).map(String::as_str) != Some("true") {
        return Ok(());
    }

    let service_id = labels
        .get(uncloud_machine::label::SERVICE_ID_LABEL)
        .cloned()
        .unwrap_or_default();
    let service_name = labels
        .get(uncloud_machine::label::SERVICE_NAME_LABEL)
        .cloned()
        .unwrap_or_default();

    let state = inspect.state.unwrap_or_default();
    let running = state.status == Some(ContainerStateStatusEnum::RUNNING);
    let (health_known, healthy) = match state.health.as_ref().and_then(|h| h.status) {
        Some(status) => (true, status == bollard::models::HealthStatusEnum::HEALTHY),
        None => (false, false),
    };

    let network_address = inspect
        .network_settings
        .as_ref()
        .and_then(|settings| settings.networks.as_ref())
        .and_then(|networks| networks.values().next())
        .and_then(|endpoint| endpoint.global_ipv6_address.as_deref())
        .filter(|addr| !addr.is_empty())
        .and_then(|addr| addr.parse::<Ipv6Addr>().ok());

    let created_unix_nanos = inspect
        .created
        .as_deref()
        .and_then(parse_created_timestamp)
        .unwrap_or(0);

    let spec = labels
        .get("uncloud.service.spec")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(serde_json::Value::Null);

    let record = ContainerRecord {
        machine_id: machine_id.to_string(),
        container: Container {
            id: container_id.to_string(),
            service_id,
            service_name,
            running,
            health_known,
            healthy,
            network_address,
            created_unix_nanos,
            labels,
            spec: ServiceSpec(spec),
        },
    };
    store.upsert_container(record).await?;
    Ok(())
}

/// Docker's `Created` timestamp is itself an RFC3339 string; reuses the
/// same parser the local `Uncloud` service uses for log-line timestamps.
fn parse_created_timestamp(s: &str) -> Option<i64> {
    crate::local_service::parse_rfc3339_nanos(s)
}
