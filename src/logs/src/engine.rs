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

//! §4.3's two dispatch modes: fast (arrival order, one shared channel) and
//! strict (global timestamp order, a k-way merge over one channel per
//! machine). Both fan out one task per machine (§5: "one goroutine per
//! machine plus one consumer").

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uncloud_machine::MachineTarget;

use crate::model::LogEntry;
use crate::print::print_warning;
use crate::source::MachineLogSource;

/// The bounded capacity of every channel in this module, per §4.3/§5: "a
/// shared buffered channel of capacity 100" (fast mode) / "each machine has
/// its own buffered channel of capacity 100" (strict mode).
const CHANNEL_CAPACITY: usize = 100;

/// Which of §4.3's two ordering modes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Print as arrived: no cross-machine ordering guarantee.
    Fast,
    /// Global, non-decreasing timestamp order via a k-way merge.
    Strict,
}

/// Fans a service's replicas, grouped by machine, out to one [`LogEntry`]
/// stream, in either mode of §4.3.
pub struct LogMergeEngine<S> {
    source: Arc<S>,
}

impl<S> LogMergeEngine<S>
where
    S: MachineLogSource + 'static,
{
    pub fn new(source: Arc<S>) -> Self {
        LogMergeEngine { source }
    }

    /// Starts fetching `service`'s logs from every machine in `targets` and
    /// returns the merged output channel. The returned receiver closes once
    /// every machine's stream has ended (or `cancellation` fires).
    pub fn run(
        &self,
        targets: Vec<MachineTarget>,
        service: String,
        mode: MergeMode,
        cancellation: CancellationToken,
    ) -> mpsc::Receiver<LogEntry> {
        match mode {
            MergeMode::Fast => run_fast(Arc::clone(&self.source), targets, service, cancellation),
            MergeMode::Strict => run_strict(Arc::clone(&self.source), targets, service, cancellation),
        }
    }
}

/// Fast mode (§4.3): every machine's task writes into the same bounded
/// channel; the caller sees entries in whatever order they arrive.
/// Testable Property 9 (liveness) holds because no producer ever waits on
/// any other — each only blocks on its own channel's backpressure.
pub fn run_fast<S>(
    source: Arc<S>,
    targets: Vec<MachineTarget>,
    service: String,
    cancellation: CancellationToken,
) -> mpsc::Receiver<LogEntry>
where
    S: MachineLogSource + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    for target in targets {
        let source = Arc::clone(&source);
        let tx = tx.clone();
        let service = service.clone();
        let cancellation = cancellation.clone();
        uncloud_ore::task::spawn(
            || format!("log-fanout-{}", target.name),
            async move { pump(&*source, &target, &service, tx, cancellation).await },
        );
    }
    // Drop our own clone: once every spawned task's clone is also dropped
    // (stream ended or cancelled), `rx` observes channel closure.
    drop(tx);
    rx
}

/// Strict mode (§4.3): every machine gets its own bounded channel; a single
/// consumer task performs the k-way merge described in "Strict-mode
/// algorithm" and forwards entries, in order, to the returned channel.
pub fn run_strict<S>(
    source: Arc<S>,
    targets: Vec<MachineTarget>,
    service: String,
    cancellation: CancellationToken,
) -> mpsc::Receiver<LogEntry>
where
    S: MachineLogSource + 'static,
{
    let mut per_machine_rx = Vec::with_capacity(targets.len());
    for target in targets {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        per_machine_rx.push(rx);
        let source = Arc::clone(&source);
        let service = service.clone();
        let cancellation = cancellation.clone();
        uncloud_ore::task::spawn(
            || format!("log-fanout-{}", target.name),
            async move { pump(&*source, &target, &service, tx, cancellation).await },
        );
    }

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(merge_consumer(per_machine_rx, out_tx, cancellation));
    out_rx
}

/// Drives one machine's log stream into `tx`, logging (but not
/// propagating) per-item transport errors per §4.3 "Failure semantics".
async fn pump<S>(
    source: &S,
    target: &MachineTarget,
    service: &str,
    tx: mpsc::Sender<LogEntry>,
    cancellation: CancellationToken,
) where
    S: MachineLogSource,
{
    let mut stream = match source.stream(target, service).await {
        Ok(stream) => stream,
        Err(err) => {
            print_warning(&target.name, &target.id, &err);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            next = stream.next() => match next {
                Some(Ok(entry)) => {
                    if tx.send(entry).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    print_warning(&target.name, &target.id, &err);
                    // A transport error ends this machine's contribution;
                    // the others are unaffected (§4.3 "do not abort other
                    // streams").
                    return;
                }
                None => return,
            },
        }
    }
}

/// One entry plus which per-machine channel it came from, ordered solely by
/// timestamp per §4.3's "min-heap of {entry, sourceChannel} keyed by
/// entry.Timestamp".
struct HeapItem {
    entry: LogEntry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.timestamp_unix_nanos == other.entry.timestamp_unix_nanos
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry.timestamp_unix_nanos.cmp(&other.entry.timestamp_unix_nanos)
    }
}

/// The consumer half of strict mode. Seeds the heap with one entry per
/// source (blocking on each in turn, so "all sources contribute before the
/// first emission"), then repeatedly pops the minimum, emits it, and pulls
/// the next entry from that same source — a single blocking receive per the
/// source's own resolution of its "double non-blocking receive" historical
/// artefact (§9 Open Questions).
async fn merge_consumer(
    mut per_machine_rx: Vec<mpsc::Receiver<LogEntry>>,
    out_tx: mpsc::Sender<LogEntry>,
    cancellation: CancellationToken,
) {
    let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::new();
    for (index, rx) in per_machine_rx.iter_mut().enumerate() {
        if let Some(entry) = rx.recv().await {
            heap.push(Reverse(HeapItem { entry, source: index }));
        }
    }

    loop {
        let Some(Reverse(item)) = heap.pop() else {
            return;
        };
        tokio::select! {
            _ = cancellation.cancelled() => return,
            result = out_tx.send(item.entry) => {
                if result.is_err() {
                    return;
                }
            }
        }
        if let Some(entry) = per_machine_rx[item.source].recv().await {
            heap.push(Reverse(HeapItem { entry, source: item.source }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::Ipv6Addr;
    use std::sync::Mutex;

    use crate::model::Stream as EntryStream;
    use crate::source::{LogEntryStream, LogSourceError};

    /// A fake source backed by a fixed, in-memory sequence of entries per
    /// machine name — deterministic, so strict-mode ordering (Testable
    /// Property 8) can be asserted exactly.
    struct FakeSource {
        entries: Mutex<std::collections::HashMap<String, VecDeque<LogEntry>>>,
    }

    impl FakeSource {
        fn new(per_machine: Vec<(&str, Vec<i64>)>) -> Self {
            let mut entries = std::collections::HashMap::new();
            for (name, timestamps) in per_machine {
                let queue: VecDeque<LogEntry> = timestamps
                    .into_iter()
                    .map(|ts| LogEntry {
                        timestamp_unix_nanos: ts,
                        machine_id: format!("{name}-id"),
                        machine_name: name.to_string(),
                        service_name: "web".to_string(),
                        replica: "0".to_string(),
                        stream: EntryStream::Stdout,
                        message: format!("{ts}").into_bytes(),
                    })
                    .collect();
                entries.insert(name.to_string(), queue);
            }
            FakeSource {
                entries: Mutex::new(entries),
            }
        }
    }

    #[async_trait::async_trait]
    impl MachineLogSource for FakeSource {
        async fn stream(&self, target: &MachineTarget, _service: &str) -> Result<LogEntryStream, LogSourceError> {
            let queue = self
                .entries
                .lock()
                .unwrap()
                .remove(&target.name)
                .unwrap_or_default();
            let items: Vec<Result<LogEntry, LogSourceError>> = queue.into_iter().map(Ok).collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn target(name: &str) -> MachineTarget {
        MachineTarget {
            id: format!("{name}-id"),
            name: name.to_string(),
            addr: Ipv6Addr::LOCALHOST,
        }
    }

    #[tokio::test]
    async fn strict_mode_orders_by_timestamp_scenario_s5() {
        let source = Arc::new(FakeSource::new(vec![
            ("a", vec![10, 30]),
            ("b", vec![20, 40]),
        ]));
        let engine = LogMergeEngine::new(source);
        let mut rx = engine.run(
            vec![target("a"), target("b")],
            "web".to_string(),
            MergeMode::Strict,
            CancellationToken::new(),
        );

        let mut timestamps = Vec::new();
        while let Some(entry) = rx.recv().await {
            timestamps.push(entry.timestamp_unix_nanos);
        }
        assert_eq!(timestamps, vec![10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn strict_mode_handles_uneven_stream_lengths() {
        let source = Arc::new(FakeSource::new(vec![
            ("a", vec![1, 2, 3, 4, 5]),
            ("b", vec![10]),
        ]));
        let engine = LogMergeEngine::new(source);
        let mut rx = engine.run(
            vec![target("a"), target("b")],
            "web".to_string(),
            MergeMode::Strict,
            CancellationToken::new(),
        );

        let mut timestamps = Vec::new();
        while let Some(entry) = rx.recv().await {
            timestamps.push(entry.timestamp_unix_nanos);
        }
        let mut sorted = timestamps.clone();
        sorted.sort_unstable();
        assert_eq!(timestamps, sorted);
        assert_eq!(timestamps.len(), 6);
    }

    #[tokio::test]
    async fn fast_mode_delivers_every_entry_regardless_of_order() {
        let source = Arc::new(FakeSource::new(vec![
            ("a", vec![5, 6, 7]),
            ("b", vec![1, 2]),
        ]));
        let engine = LogMergeEngine::new(source);
        let mut rx = engine.run(
            vec![target("a"), target("b")],
            "web".to_string(),
            MergeMode::Fast,
            CancellationToken::new(),
        );

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
