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

//! §3 `LogEntry`: the client-side, already-demultiplexed unit the merge
//! engine operates on. Not persisted anywhere; it only ever exists in
//! memory between a machine's gRPC stream and the consumer.

use std::cmp::Ordering;

/// Which of a container's two standard streams a [`LogEntry`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One already-tagged log line, ready to be ordered and printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp_unix_nanos: i64,
    pub machine_id: String,
    pub machine_name: String,
    pub service_name: String,
    pub replica: String,
    pub stream: Stream,
    pub message: Vec<u8>,
}

/// Orders entries by timestamp only, per §4.3 "Strict-mode algorithm": the
/// min-heap key is `entry.Timestamp`, nothing else. Two entries with equal
/// timestamps compare equal here; the heap does not promise any particular
/// tie-break order between them, matching the source's own behavior.
impl PartialOrd for LogEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp_unix_nanos.cmp(&other.timestamp_unix_nanos)
    }
}
