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

//! The Director: inspects inbound request metadata, picks one-to-one or
//! one-to-many dispatch per §4.1's routing rules, and (in one-to-many mode)
//! merges the tagged per-peer replies. Effectively process-wide state
//! (§9 "Global state"): one instance per daemon, constructed explicitly at
//! startup and handed to the RPC listener, never a module-level singleton.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tonic::Status;

use uncloud_machine::{MachineMapper, MachineTarget, MapperError};
use uncloud_proto::merge;

use crate::backend::{Backend, MetadataInjector, RemoteBackend};

/// Metadata key carrying a singular machine name/ID (§4.1 rule 3, §6).
pub const MACHINE_KEY: &str = "machine";
/// Metadata key carrying a comma-separated list of machine names/IDs, or
/// the sentinel `"*"` (§4.1 rule 4, §6).
pub const MACHINES_KEY: &str = "machines";
/// Metadata key the Director sets on outbound proxied calls; its presence
/// on an inbound call means "terminate locally, do not re-proxy" (§4.1
/// rule 1, §6).
pub const PROXY_AUTHORITY_KEY: &str = "proxy-authority";

/// The outcome of routing one inbound call, before the transport layer
/// actually dispatches it.
enum Route {
    /// Forward raw bytes to a single backend and return its raw reply
    /// unmodified — no `ResponseMetadata` is injected (§3 "absent in
    /// one-to-one mode").
    OneToOne(Arc<dyn Backend>),
    /// Forward to every backend in parallel; each reply (success or
    /// per-peer failure) is tagged and the results concatenated per
    /// §4.1 "Response merging".
    OneToMany(Vec<MetadataInjector<dyn Backend>>),
}

/// Routes and dispatches inbound calls. Owns the [`RemoteBackend`] cache
/// exclusively (§3 "Ownership summary"); backends never reference the
/// Director back (§9 "Cyclic references"). Generic over the local backend
/// type (normally [`crate::backend::LocalBackend`]) so the routing logic
/// can be exercised in tests without a real domain socket.
pub struct Director<L, M> {
    local: Arc<L>,
    local_target: std::sync::OnceLock<MachineTarget>,
    mapper: Arc<M>,
    remote_port: u16,
    cache: DashMap<SocketAddr, Arc<RemoteBackend>>,
}

impl<L, M> Director<L, M>
where
    L: Backend + 'static,
    M: MachineMapper,
{
    pub fn new(local: Arc<L>, mapper: Arc<M>, remote_port: u16) -> Self {
        Director {
            local,
            local_target: std::sync::OnceLock::new(),
            mapper,
            remote_port,
            cache: DashMap::new(),
        }
    }

    /// Dispatches one inbound call, applying §4.1's routing rules, and
    /// returns the (possibly merged) raw reply bytes ready to hand back to
    /// the caller.
    pub async fn dispatch(
        &self,
        path: PathAndQuery,
        mut metadata: MetadataMap,
        body: Bytes,
    ) -> Result<Bytes, Status> {
        let route = self.route(&metadata).await?;
        rewrite_outbound_metadata(&mut metadata);

        match route {
            Route::OneToOne(backend) => backend.call(path, metadata, body).await,
            Route::OneToMany(injectors) => {
                let calls = injectors.into_iter().map(|injector| {
                    let path = path.clone();
                    let metadata = metadata.clone();
                    let body = body.clone();
                    async move {
                        // `MetadataInjector::call` never returns `Err`: any
                        // backend failure is already materialised as a
                        // per-peer failure element (§4.1 "Error reporting in
                        // one-to-many mode").
                        injector.call(path, metadata, body).await
                    }
                });
                let elements: Vec<Bytes> = join_all(calls)
                    .await
                    .into_iter()
                    .collect::<Result<_, Status>>()?;
                Ok(merge::merge_elements(elements))
            }
        }
    }

    async fn route(&self, metadata: &MetadataMap) -> Result<Route, Status> {
        // Rule 1.
        if metadata.get(PROXY_AUTHORITY_KEY).is_some() {
            return Ok(Route::OneToOne(self.local.clone()));
        }

        let machine = get_ascii(metadata, MACHINE_KEY);
        let machines = get_ascii(metadata, MACHINES_KEY);

        // Rule 2.
        if machine.is_none() && machines.is_none() {
            return Ok(Route::OneToOne(self.local.clone()));
        }

        // Rule 4 takes precedence when both are set, per §9 Design Notes'
        // inherited convention from the source.
        if let Some(machines) = machines {
            let names: Vec<String> = machines
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if names.is_empty() {
                return Err(Status::invalid_argument("machines list must not be empty"));
            }
            let targets = self
                .mapper
                .resolve_many(&names)
                .await
                .map_err(mapper_error_to_status)?;
            let mut injectors = Vec::with_capacity(targets.len());
            for target in targets {
                let backend = self.backend_for(&target).await;
                injectors.push(MetadataInjector::new(
                    backend,
                    format!("[{}]", target.addr),
                    target.id,
                    target.name,
                ));
            }
            return Ok(Route::OneToMany(injectors));
        }

        // Rule 3.
        let name = machine.expect("checked above");
        let target = self
            .mapper
            .resolve_one(&name)
            .await
            .map_err(mapper_error_to_status)?;
        let backend = self.backend_for(&target).await;
        Ok(Route::OneToOne(backend))
    }

    /// Resolves `target` to a concrete backend: the `LocalBackend` if it is
    /// this machine (§4.1 "Backend resolution"), otherwise a cached or
    /// freshly constructed `RemoteBackend`.
    async fn backend_for(&self, target: &MachineTarget) -> Arc<dyn Backend> {
        if self.is_local(target).await {
            return self.local.clone();
        }
        let addr = SocketAddr::from((target.addr, self.remote_port));
        self.remote_backend(addr)
    }

    async fn is_local(&self, target: &MachineTarget) -> bool {
        match self.local_target.get() {
            Some(local) => local.id == target.id,
            None => {
                if let Ok(local) = self.mapper.local_target().await {
                    let is_local = local.id == target.id;
                    let _ = self.local_target.set(local);
                    is_local
                } else {
                    false
                }
            }
        }
    }

    /// Gets-or-inserts a `RemoteBackend` for `addr`. A concurrent
    /// first-time construction is reconciled explicitly: the loser of the
    /// race discards its just-built backend and returns the winner's,
    /// since `DashMap::entry` alone does not expose that race point
    /// (§5 "the loser of a concurrent insert discards its partially built
    /// backend").
    fn remote_backend(&self, addr: SocketAddr) -> Arc<RemoteBackend> {
        if let Some(existing) = self.cache.get(&addr) {
            return Arc::clone(&existing);
        }
        let candidate = Arc::new(RemoteBackend::new(addr));
        match self.cache.entry(addr) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&candidate));
                candidate
            }
        }
    }

    /// Closes every cached `RemoteBackend` and clears the cache (§4.1
    /// "Lifecycle"). Used on membership changes; does not close the
    /// `LocalBackend`.
    pub async fn flush_on_membership_change(&self) {
        let backends: Vec<Arc<RemoteBackend>> =
            self.cache.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.cache.clear();
        for backend in backends {
            backend.close().await;
        }
    }

    /// Closes the Director: flushes the remote cache and closes the local
    /// backend too (§4.1 "Lifecycle"). Idempotent.
    pub async fn close(&self) {
        self.flush_on_membership_change().await;
        self.local.close().await;
    }
}

fn get_ascii<'a>(metadata: &'a MetadataMap, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|v| v.to_str().ok())
}

fn rewrite_outbound_metadata(metadata: &mut MetadataMap) {
    metadata.remove(MACHINE_KEY);
    metadata.remove(MACHINES_KEY);
    let key: MetadataKey<Ascii> = MetadataKey::from_static(PROXY_AUTHORITY_KEY);
    let value: MetadataValue<Ascii> = MetadataValue::from_static("true");
    metadata.insert(key, value);
}

fn mapper_error_to_status(err: MapperError) -> Status {
    match err {
        MapperError::NotFound(name) => {
            Status::invalid_argument(format!("unknown machine {name:?}"))
        }
        MapperError::SomeNotFound(names) => Status::invalid_argument(format!(
            "unknown machines: {}",
            names.join(", ")
        )),
        MapperError::EmptyList => {
            Status::invalid_argument("machines list must not be empty")
        }
        MapperError::Store(err) => Status::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    use async_trait::async_trait;
    use tonic::metadata::{MetadataKey, MetadataValue};

    struct FakeBackend {
        id: &'static str,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn call(
            &self,
            _path: PathAndQuery,
            _metadata: MetadataMap,
            _body: Bytes,
        ) -> Result<Bytes, Status> {
            Ok(Bytes::from(self.id))
        }

        async fn close(&self) {}
    }

    struct FakeMapper {
        local_id: &'static str,
        targets: Vec<MachineTarget>,
    }

    impl FakeMapper {
        fn new(local_id: &'static str, targets: Vec<MachineTarget>) -> Self {
            FakeMapper { local_id, targets }
        }
    }

    #[async_trait]
    impl MachineMapper for FakeMapper {
        async fn resolve_one(&self, name_or_id: &str) -> Result<MachineTarget, MapperError> {
            self.targets
                .iter()
                .find(|t| t.id == name_or_id || t.name == name_or_id)
                .cloned()
                .ok_or_else(|| MapperError::NotFound(name_or_id.to_string()))
        }

        async fn resolve_many(&self, names: &[String]) -> Result<Vec<MachineTarget>, MapperError> {
            if names.is_empty() {
                return Err(MapperError::EmptyList);
            }
            if names.iter().any(|n| n == uncloud_machine::mapper::WILDCARD) {
                return Ok(self.targets.clone());
            }
            let mut out = Vec::new();
            let mut missing = Vec::new();
            for name in names {
                match self.targets.iter().find(|t| &t.id == name || &t.name == name) {
                    Some(t) => out.push(t.clone()),
                    None => missing.push(name.clone()),
                }
            }
            if !missing.is_empty() {
                return Err(MapperError::SomeNotFound(missing));
            }
            Ok(out)
        }

        async fn local_target(&self) -> Result<MachineTarget, MapperError> {
            self.resolve_one(self.local_id).await
        }
    }

    fn target(id: &str, addr: Ipv6Addr) -> MachineTarget {
        MachineTarget {
            id: id.to_string(),
            name: format!("{id}-name"),
            addr,
        }
    }

    fn director_with(
        mapper: FakeMapper,
    ) -> Director<FakeBackend, FakeMapper> {
        Director::new(Arc::new(FakeBackend { id: "local" }), Arc::new(mapper), 9999)
    }

    fn empty_metadata() -> MetadataMap {
        MetadataMap::new()
    }

    #[tokio::test]
    async fn rule1_proxy_authority_present_routes_local() {
        let director = director_with(FakeMapper::new("m0", vec![target("m0", Ipv6Addr::LOCALHOST)]));
        let mut metadata = empty_metadata();
        metadata.insert(
            MetadataKey::from_static(PROXY_AUTHORITY_KEY),
            MetadataValue::from_static("true"),
        );
        let route = director.route(&metadata).await.unwrap();
        assert!(matches!(route, Route::OneToOne(_)));
    }

    #[tokio::test]
    async fn rule2_no_machine_keys_routes_local() {
        let director = director_with(FakeMapper::new("m0", vec![target("m0", Ipv6Addr::LOCALHOST)]));
        let route = director.route(&empty_metadata()).await.unwrap();
        assert!(matches!(route, Route::OneToOne(_)));
    }

    #[tokio::test]
    async fn rule3_machine_equal_to_local_addr_yields_local_backend() {
        let director = director_with(FakeMapper::new("m0", vec![target("m0", Ipv6Addr::LOCALHOST)]));
        let mut metadata = empty_metadata();
        metadata.insert(
            MetadataKey::from_static(MACHINE_KEY),
            MetadataValue::from_static("m0"),
        );
        let route = director.route(&metadata).await.unwrap();
        match route {
            Route::OneToOne(backend) => {
                let reply = backend
                    .call(PathAndQuery::from_static("/x"), empty_metadata(), Bytes::new())
                    .await
                    .unwrap();
                assert_eq!(reply, Bytes::from_static(b"local"));
            }
            other => panic!("expected OneToOne, got a different route: {}", matches!(other, Route::OneToMany(_))),
        }
    }

    #[tokio::test]
    async fn rule3_unknown_machine_fails_invalid_argument() {
        let director = director_with(FakeMapper::new("m0", vec![target("m0", Ipv6Addr::LOCALHOST)]));
        let mut metadata = empty_metadata();
        metadata.insert(
            MetadataKey::from_static(MACHINE_KEY),
            MetadataValue::from_static("ghost"),
        );
        let err = director.route(&metadata).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn rule4_empty_machines_list_fails() {
        let director = director_with(FakeMapper::new("m0", vec![target("m0", Ipv6Addr::LOCALHOST)]));
        let mut metadata = empty_metadata();
        metadata.insert(
            MetadataKey::from_static(MACHINES_KEY),
            MetadataValue::from_static(""),
        );
        let err = director.route(&metadata).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn rule4_dispatches_one_to_many_for_every_resolved_target() {
        let director = director_with(FakeMapper::new(
            "m0",
            vec![
                target("m0", Ipv6Addr::LOCALHOST),
                target("m1", Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 2)),
            ],
        ));
        let mut metadata = empty_metadata();
        metadata.insert(
            MetadataKey::from_static(MACHINES_KEY),
            MetadataValue::from_static("*"),
        );
        let route = director.route(&metadata).await.unwrap();
        match route {
            Route::OneToMany(injectors) => assert_eq!(injectors.len(), 2),
            Route::OneToOne(_) => panic!("expected OneToMany"),
        }
    }

    #[tokio::test]
    async fn cache_coherence_concurrent_lookups_share_one_backend() {
        let director = director_with(FakeMapper::new(
            "m0",
            vec![
                target("m0", Ipv6Addr::LOCALHOST),
                target("m1", Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 2)),
            ],
        ));
        let remote = target("m1", Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 2));

        let (a, b) = tokio::join!(director.backend_for(&remote), director.backend_for(&remote));
        // Neither resolved to the local backend (different ID), so both
        // must be the same cached `RemoteBackend` instance.
        let addr = SocketAddr::from((remote.addr, 9999));
        assert_eq!(director.cache.len(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        let _ = director.cache.get(&addr).unwrap();
    }
}
