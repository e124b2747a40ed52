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

//! Wire schema for uncloud's fan-out RPC, generated from `proto/uncloud.proto`,
//! plus the byte-level utilities the Director uses to merge per-machine
//! replies without parsing them (see [`merge`]).

pub mod merge;

tonic::include_proto!("uncloud");

/// Field number of the `repeated XReply messages = 1` wrapper in every
/// non-streaming response, and of `ResponseMetadata metadata = 1` inside
/// every `XReply`. The two are required by spec to be the same number so
/// that merging can happen without per-method knowledge.
pub const REPLY_FIELD: u32 = 1;

/// Field number of `ResponseMetadata` within a `Reply`-shaped message.
pub const METADATA_FIELD: u32 = 1;

impl ResponseMetadata {
    /// Builds a metadata envelope tagging a successful reply from `machine`.
    pub fn success(machine_addr: String, machine_id: String, machine_name: String) -> Self {
        ResponseMetadata {
            machine_addr,
            machine_id,
            machine_name,
            error: String::new(),
            status: None,
        }
    }

    /// Builds a metadata envelope tagging a peer that failed to answer.
    pub fn failure(
        machine_addr: String,
        machine_id: String,
        machine_name: String,
        code: i32,
        message: String,
    ) -> Self {
        ResponseMetadata {
            machine_addr,
            machine_id,
            machine_name,
            error: message.clone(),
            status: Some(Status { code, message }),
        }
    }
}
