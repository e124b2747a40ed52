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

//! Cluster membership and container inventory: the data model of §3, the
//! embedded store that persists it, and the label parsing that derives
//! ingress ports from a container's Docker labels.

pub mod info;
pub mod label;
pub mod mapper;
pub mod store;

pub use info::{Container, ContainerRecord, MachineInfo, MachineTarget, ServiceSpec};
pub use mapper::{MachineMapper, MapperError, StoreMachineMapper};
pub use store::{SqliteStore, Store, StoreError};
