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

//! The fan-out RPC proxy of §4.1: the [`Director`] decides, per inbound
//! call's metadata, whether to dispatch locally or to one or many peers,
//! and the [`backend`] module supplies the transports and the
//! metadata-tagging decorator that makes one-to-many merging possible.

pub mod backend;
pub mod codec;
pub mod director;
pub mod server;

pub use backend::{Backend, LocalBackend, MetadataInjector, RemoteBackend};
pub use codec::RawCodec;
pub use director::Director;
pub use server::DirectorService;
