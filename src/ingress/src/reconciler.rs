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

//! The reconciler itself: a single long-lived task (§4.2 "Concurrency":
//! "single reconciliation goroutine; no two rebuilds run concurrently") that
//! reruns the algorithm of §4.2 on every inventory change notification.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use uncloud_machine::{ContainerRecord, Store};

use crate::admin::ReverseProxyAdmin;
use crate::config::IngressConfig;
use crate::error::{ReconcileError, ReverseProxyAdminError};
use crate::render;

const CADDY_SERVICE_NAME: &str = "caddy";

/// Drives the ingress-configuration reconcile loop for one machine. Generic
/// over the admin client so routing/rendering logic can be exercised in
/// tests against a fake [`ReverseProxyAdmin`] instead of a real Caddy
/// process, mirroring `rpc::Director`'s genericity over its local backend.
pub struct IngressReconciler<S, A> {
    store: Arc<S>,
    admin: A,
    config: IngressConfig,
}

impl<S, A> IngressReconciler<S, A>
where
    S: Store,
    A: ReverseProxyAdmin,
{
    pub fn new(store: Arc<S>, admin: A, config: IngressConfig) -> Self {
        IngressReconciler {
            store,
            admin,
            config,
        }
    }

    /// Runs until `cancellation` fires or the inventory subscription closes
    /// (§4.2 "the inventory subscription is closed on context
    /// cancellation"). Reconciles once immediately against the initial
    /// snapshot, then once per change notification.
    pub async fn run(self, cancellation: CancellationToken) -> Result<(), ReconcileError> {
        let mut subscription = self
            .store
            .subscribe()
            .await
            .map_err(|err| ReconcileError::Inventory(err.into()))?;

        if let Err(err) = reconcile(&self.config, &self.admin, &subscription.snapshot).await {
            tracing::error!(error = %err, "initial ingress reconcile failed");
        }

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!("ingress reconciler shutting down");
                    return Ok(());
                }
                received = subscription.changes.recv() => {
                    match received {
                        Ok(()) => self.reconcile_from_store().await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "missed inventory notifications; reconciling from latest snapshot");
                            self.reconcile_from_store().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("inventory subscription closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn reconcile_from_store(&self) {
        match self.store.containers().await {
            Ok(records) => {
                if let Err(err) = reconcile(&self.config, &self.admin, &records).await {
                    tracing::error!(error = %err, "ingress reconcile failed");
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to enumerate container inventory");
            }
        }
    }
}

/// One full pass of §4.2's algorithm over a fixed inventory snapshot.
async fn reconcile(
    config: &IngressConfig,
    admin: &impl ReverseProxyAdmin,
    records: &[ContainerRecord],
) -> Result<(), ReconcileError> {
    let base = render::render_base(&config.local_machine_id, records)?;
    let mut candidate = base.clone();

    // Step 6: the local `caddy` service's global custom config, if any.
    if let Some(container) = render::latest_custom_config(
        records,
        &config.local_machine_id,
        CADDY_SERVICE_NAME,
    ) {
        let block = render::expand_upstreams(container.custom_config().unwrap_or_default(), records);
        let trial = format!("{block}\n{candidate}");
        match admin.adapt(&trial).await {
            Ok(_) => candidate = trial,
            Err(ReverseProxyAdminError::Rejected(reason)) => {
                tracing::warn!(service = CADDY_SERVICE_NAME, %reason, "dropping invalid global custom config");
            }
            Err(ReverseProxyAdminError::Unreachable(reason)) => {
                tracing::warn!(%reason, "cannot validate global custom config: admin interface unreachable");
            }
        }
    }

    // Step 7: every other service's most recent custom config block.
    for service in render::other_service_names(records, CADDY_SERVICE_NAME) {
        let Some(container) = render::latest_custom_config_any_machine(records, &service) else {
            continue;
        };
        let value = render::expand_upstreams(container.custom_config().unwrap_or_default(), records);
        let trial = format!("{candidate}\n# {service}\n{value}\n");
        match admin.adapt(&trial).await {
            Ok(_) => candidate = trial,
            Err(ReverseProxyAdminError::Rejected(reason)) => {
                tracing::warn!(%service, %reason, "dropping invalid custom config block");
            }
            Err(ReverseProxyAdminError::Unreachable(reason)) => {
                tracing::warn!(%reason, "cannot validate custom config: admin interface unreachable");
            }
        }
    }

    // Step 8.
    if !admin.probe_reachable().await {
        write_file(config, &base).await?;
        tracing::warn!("reverse proxy admin interface unreachable; wrote base configuration only");
        return Ok(());
    }

    let adapted = match admin.adapt(&candidate).await {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(error = %err, "final candidate failed validation; leaving on-disk configuration untouched");
            return Ok(());
        }
    };

    match admin.load(adapted).await {
        Ok(()) => {
            if let Err(err) = write_file(config, &candidate).await {
                tracing::warn!(error = %err, "hot-load succeeded but failed to persist configuration file; next cycle will retry");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "hot-load failed; leaving on-disk configuration untouched");
        }
    }

    Ok(())
}

async fn write_file(config: &IngressConfig, contents: &str) -> Result<(), ReconcileError> {
    let path = config.caddyfile_path();
    tokio::fs::write(&path, contents)
        .await
        .map_err(ReconcileError::Io)?;

    let mut perms = tokio::fs::metadata(&path)
        .await
        .map_err(ReconcileError::Io)?
        .permissions();
    perms.set_mode(0o640);
    tokio::fs::set_permissions(&path, perms)
        .await
        .map_err(ReconcileError::Io)?;

    let group_name = config.config_group.clone();
    let chown_path = path.clone();
    tokio::task::spawn_blocking(move || set_owning_group(&chown_path, &group_name))
        .await
        .expect("chown task panicked");
    Ok(())
}

/// Best-effort: changing a file's owning group to anything but one the
/// calling process already belongs to requires privileges this daemon may
/// not have in every deployment (e.g. a rootless container). §4.2's fixed
/// owning group is a deployment convention, not something a reconcile cycle
/// should abort over, so failures here are logged, not propagated.
fn set_owning_group(path: &std::path::Path, group_name: &str) {
    match nix::unistd::Group::from_name(group_name) {
        Ok(Some(group)) => {
            if let Err(err) = nix::unistd::chown(path, None, Some(group.gid)) {
                tracing::warn!(%group_name, %err, "failed to set configuration file's owning group");
            }
        }
        Ok(None) => {
            tracing::warn!(%group_name, "configured owning group does not exist; leaving file ownership unchanged");
        }
        Err(err) => {
            tracing::warn!(%group_name, %err, "failed to resolve configured owning group");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv6Addr;

    use async_trait::async_trait;
    use bytes::Bytes;

    use uncloud_machine::{Container, ServiceSpec};

    use super::*;

    /// A fake reverse-proxy admin that can be configured to reject `adapt`
    /// calls by substring or unconditionally, and to report unreachable,
    /// without dialing anything real.
    struct FakeAdmin {
        reject_substring: Option<&'static str>,
        reject_all: bool,
        reachable: bool,
    }

    impl FakeAdmin {
        fn accepting() -> Self {
            FakeAdmin {
                reject_substring: None,
                reject_all: false,
                reachable: true,
            }
        }

        fn rejecting(substring: &'static str) -> Self {
            FakeAdmin {
                reject_substring: Some(substring),
                ..FakeAdmin::accepting()
            }
        }

        fn rejecting_final() -> Self {
            FakeAdmin {
                reject_all: true,
                ..FakeAdmin::accepting()
            }
        }

        fn unreachable() -> Self {
            FakeAdmin {
                reachable: false,
                ..FakeAdmin::accepting()
            }
        }
    }

    #[async_trait]
    impl ReverseProxyAdmin for FakeAdmin {
        async fn adapt(&self, caddyfile: &str) -> Result<Bytes, ReverseProxyAdminError> {
            let rejected = self.reject_all
                || self
                    .reject_substring
                    .map(|s| caddyfile.contains(s))
                    .unwrap_or(false);
            if rejected {
                return Err(ReverseProxyAdminError::Rejected("fake rejection".to_string()));
            }
            Ok(Bytes::from(caddyfile.to_string()))
        }

        async fn load(&self, _json_config: Bytes) -> Result<(), ReverseProxyAdminError> {
            Ok(())
        }

        async fn probe_reachable(&self) -> bool {
            self.reachable
        }
    }

    fn container_record(
        machine_id: &str,
        service_name: &str,
        container_id: &str,
        hostname: &str,
        published_port: u16,
        created_unix_nanos: i64,
        custom_config: Option<&str>,
    ) -> ContainerRecord {
        let mut labels = BTreeMap::new();
        labels.insert(
            "uncloud.service.ports".to_string(),
            format!("{hostname}:{published_port}:80/http"),
        );
        if let Some(value) = custom_config {
            labels.insert("uncloud.ingress.custom-config".to_string(), value.to_string());
        }
        ContainerRecord {
            machine_id: machine_id.to_string(),
            container: Container {
                id: container_id.to_string(),
                service_id: format!("{service_name}-svc"),
                service_name: service_name.to_string(),
                running: true,
                health_known: false,
                healthy: false,
                network_address: Some(Ipv6Addr::LOCALHOST),
                created_unix_nanos,
                labels,
                spec: ServiceSpec(serde_json::Value::Null),
            },
        }
    }

    fn test_config(dir: &std::path::Path) -> IngressConfig {
        IngressConfig {
            config_dir: dir.to_path_buf(),
            admin_socket_path: dir.join("admin.sock"),
            config_group: "uncloud-test-nonexistent-group".to_string(),
            local_machine_id: "m1".to_string(),
        }
    }

    /// Testable Property 5: an identical inventory snapshot always renders
    /// byte-identical configuration, regardless of map/hash iteration order.
    #[tokio::test]
    async fn reconcile_is_deterministic_across_identical_snapshots() {
        let records = vec![container_record("m1", "web", "c1", "app.example.com", 8080, 1, None)];

        let dir_a = tempfile::tempdir().unwrap();
        reconcile(&test_config(dir_a.path()), &FakeAdmin::accepting(), &records)
            .await
            .unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        reconcile(&test_config(dir_b.path()), &FakeAdmin::accepting(), &records)
            .await
            .unwrap();

        let written_a = tokio::fs::read_to_string(test_config(dir_a.path()).caddyfile_path())
            .await
            .unwrap();
        let written_b = tokio::fs::read_to_string(test_config(dir_b.path()).caddyfile_path())
            .await
            .unwrap();
        assert_eq!(written_a, written_b);
    }

    /// Testable Property 6: a custom config block that fails `adapt`
    /// validation is dropped from the candidate, not fatal to the cycle.
    #[tokio::test]
    async fn invalid_custom_config_block_is_dropped_not_fatal() {
        let records = vec![
            container_record("m1", "web", "c1", "app.example.com", 8080, 1, None),
            container_record("m1", "caddy", "c2", "", 0, 1, Some("this block has BADMARKER in it")),
        ];

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        reconcile(&config, &FakeAdmin::rejecting("BADMARKER"), &records)
            .await
            .unwrap();

        let written = tokio::fs::read_to_string(config.caddyfile_path()).await.unwrap();
        assert!(!written.contains("BADMARKER"));
        assert!(written.contains("app.example.com"));
    }

    /// Testable Property 7: if the final candidate fails validation, the
    /// on-disk configuration is left completely untouched.
    #[tokio::test]
    async fn failed_final_validation_leaves_file_untouched() {
        let records = vec![container_record("m1", "web", "c1", "app.example.com", 8080, 1, None)];
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        tokio::fs::write(config.caddyfile_path(), "previous generation\n")
            .await
            .unwrap();

        reconcile(&config, &FakeAdmin::rejecting_final(), &records)
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(config.caddyfile_path()).await.unwrap();
        assert_eq!(contents, "previous generation\n");
    }

    /// §4.2 step 8's degrade path: an unreachable admin interface still
    /// gets the base configuration written, with every custom block
    /// omitted since none of them could be validated.
    #[tokio::test]
    async fn unreachable_admin_writes_base_configuration_only() {
        let records = vec![
            container_record("m1", "web", "c1", "app.example.com", 8080, 1, None),
            container_record("m1", "caddy", "c2", "", 0, 1, Some("# extra custom block\n")),
        ];

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        reconcile(&config, &FakeAdmin::unreachable(), &records)
            .await
            .unwrap();

        let written = tokio::fs::read_to_string(config.caddyfile_path()).await.unwrap();
        assert!(written.contains("app.example.com"));
        assert!(!written.contains("extra custom block"));
    }
}
