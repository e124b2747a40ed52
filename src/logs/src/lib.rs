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

//! The ordered log-merge engine of §4.3: fans out one `StreamLogs` call per
//! machine and emits a single stream of [`model::LogEntry`], either in
//! arrival order ("fast" mode) or in non-decreasing timestamp order
//! ("strict" mode, a k-way merge).

pub mod color;
pub mod engine;
pub mod model;
pub mod print;
pub mod source;

pub use engine::{run_fast, run_strict, LogMergeEngine};
pub use model::{LogEntry, Stream};
pub use source::{LogSourceError, MachineLogSource};
