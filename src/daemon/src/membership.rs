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

//! Notices changes to the machine table the cluster's gossip/state store
//! (out of scope; spec.md §1) is assumed to keep current, and flushes the
//! `Director`'s remote-backend cache accordingly, per §4.1 "Lifecycle":
//! cached backends are closed "used on membership changes".

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use uncloud_machine::{MachineMapper, Store};
use uncloud_rpc::{Backend, Director};

pub async fn run<S, L, M>(
    store: Arc<S>,
    director: Arc<Director<L, M>>,
    poll_interval: Duration,
    cancellation: CancellationToken,
) where
    S: Store,
    L: Backend + 'static,
    M: MachineMapper + 'static,
{
    let mut known = snapshot(&store).await;
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let current = snapshot(&store).await;
        if current != known {
            tracing::info!("cluster membership changed; flushing remote backend cache");
            director.flush_on_membership_change().await;
            known = current;
        }
    }
}

async fn snapshot<S: Store>(store: &Arc<S>) -> BTreeSet<(String, String, String)> {
    match store.machines().await {
        Ok(machines) => machines
            .into_iter()
            .map(|m| (m.id, m.name, m.network_address.to_string()))
            .collect(),
        Err(err) => {
            tracing::warn!(%err, "failed to list machines while polling for membership changes");
            BTreeSet::new()
        }
    }
}
