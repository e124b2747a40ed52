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

//! Resolves machine names/IDs (or the wildcard `"*"`) to concrete transport
//! addresses, per §4.1 routing rules 3 and 4.

use std::sync::Arc;

use async_trait::async_trait;

use crate::info::MachineTarget;
use crate::store::Store;

/// The wildcard that, inside a `machines` list, means "every cluster
/// member".
pub const WILDCARD: &str = "*";

#[derive(Debug, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum MapperError {
    /// §4.1 rule 3: a singular `machine` key that did not resolve.
    #[error("unknown machine {0:?}")]
    NotFound(String),
    /// §4.1 rule 4: a plural `machines` list naming one or more unknown
    /// machines, enumerated as required by scenario S6.
    #[error("unknown machines: {}", .0.join(", "))]
    SomeNotFound(Vec<String>),
    /// §4.1 rule 4: an empty `machines` list.
    #[error("machines list must not be empty")]
    EmptyList,
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Resolves the metadata-carried `machine`/`machines` values used by the
/// Director's routing rules to concrete [`MachineTarget`]s.
#[async_trait]
pub trait MachineMapper: Send + Sync {
    /// §4.1 rule 3: resolve a single name or ID. Fails if it does not
    /// resolve to exactly one known machine.
    async fn resolve_one(&self, name_or_id: &str) -> Result<MachineTarget, MapperError>;

    /// §4.1 rule 4: resolve a non-empty list of names/IDs, or the single
    /// wildcard `"*"` meaning every cluster member. Fails on an empty list
    /// or on any name that does not resolve, naming every such name in the
    /// error (scenario S6).
    async fn resolve_many(&self, names: &[String]) -> Result<Vec<MachineTarget>, MapperError>;

    /// The local machine's own target, used to detect when a resolved
    /// target is actually local (§4.1 "Backend resolution").
    async fn local_target(&self) -> Result<MachineTarget, MapperError>;
}

/// A [`MachineMapper`] backed by a [`Store`].
pub struct StoreMachineMapper<S> {
    store: Arc<S>,
    local_machine_id: String,
}

impl<S> StoreMachineMapper<S> {
    pub fn new(store: Arc<S>, local_machine_id: String) -> Self {
        StoreMachineMapper {
            store,
            local_machine_id,
        }
    }
}

#[async_trait]
impl<S> MachineMapper for StoreMachineMapper<S>
where
    S: Store,
{
    async fn resolve_one(&self, name_or_id: &str) -> Result<MachineTarget, MapperError> {
        self.store
            .machine(name_or_id)
            .await?
            .map(MachineTarget::from)
            .ok_or_else(|| MapperError::NotFound(name_or_id.to_string()))
    }

    async fn resolve_many(&self, names: &[String]) -> Result<Vec<MachineTarget>, MapperError> {
        if names.is_empty() {
            return Err(MapperError::EmptyList);
        }
        if names.iter().any(|n| n == WILDCARD) {
            return Ok(self
                .store
                .machines()
                .await?
                .into_iter()
                .map(MachineTarget::from)
                .collect());
        }

        let mut targets = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match self.store.machine(name).await? {
                Some(info) => targets.push(MachineTarget::from(info)),
                None => missing.push(name.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(MapperError::SomeNotFound(missing));
        }
        Ok(targets)
    }

    async fn local_target(&self) -> Result<MachineTarget, MapperError> {
        self.resolve_one(&self.local_machine_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::MachineInfo;
    use crate::store::SqliteStore;
    use std::net::Ipv6Addr;

    async fn mapper_with_machines(n: usize) -> (StoreMachineMapper<SqliteStore>, Vec<String>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut ids = Vec::new();
        for i in 0..n {
            let id = format!("m{i}");
            store
                .upsert_machine(MachineInfo {
                    id: id.clone(),
                    name: format!("name-{i}"),
                    network_address: Ipv6Addr::LOCALHOST,
                })
                .await
                .unwrap();
            ids.push(id);
        }
        (StoreMachineMapper::new(store, "m0".to_string()), ids)
    }

    #[tokio::test]
    async fn resolve_one_finds_by_id_or_name() {
        let (mapper, ids) = mapper_with_machines(1).await;
        assert_eq!(mapper.resolve_one(&ids[0]).await.unwrap().id, ids[0]);
        assert_eq!(mapper.resolve_one("name-0").await.unwrap().id, ids[0]);
    }

    #[tokio::test]
    async fn resolve_one_unknown_fails() {
        let (mapper, _ids) = mapper_with_machines(1).await;
        assert!(matches!(
            mapper.resolve_one("nope").await,
            Err(MapperError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolve_many_wildcard_returns_all() {
        let (mapper, ids) = mapper_with_machines(3).await;
        let targets = mapper.resolve_many(&["*".to_string()]).await.unwrap();
        assert_eq!(targets.len(), ids.len());
    }

    #[tokio::test]
    async fn resolve_many_empty_list_fails() {
        let (mapper, _ids) = mapper_with_machines(1).await;
        assert!(matches!(
            mapper.resolve_many(&[]).await,
            Err(MapperError::EmptyList)
        ));
    }

    #[tokio::test]
    async fn resolve_many_enumerates_missing_names() {
        let (mapper, ids) = mapper_with_machines(1).await;
        let err = mapper
            .resolve_many(&[ids[0].clone(), "ghost".to_string()])
            .await
            .unwrap_err();
        match err {
            MapperError::SomeNotFound(missing) => assert_eq!(missing, vec!["ghost".to_string()]),
            other => panic!("expected SomeNotFound, got {other:?}"),
        }
    }
}
