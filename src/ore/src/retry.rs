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

//! Exponential-backoff retry, used by the RPC layer's per-machine
//! reconnect loop and by the ingress reconciler's admin-API probe.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configures and runs an exponential backoff retry loop.
///
/// ```ignore
/// let value = Retry::default()
///     .clamp_backoff(Duration::from_secs(32))
///     .retry_async(|state| async move {
///         connect().await.map_err(|e| {
///             warn!("retrying in {:?}: {e}", state.next_backoff.unwrap());
///             e
///         })
///     })
///     .await?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    initial_backoff: Duration,
    multiplier: u32,
    max_backoff: Duration,
    max_tries: usize,
    jitter: bool,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            multiplier: 2,
            max_backoff: Duration::MAX,
            max_tries: usize::MAX,
            jitter: true,
        }
    }
}

/// The state passed to the retry closure on each attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// The number of attempts made so far, including the current one,
    /// starting at 1.
    pub i: usize,
    /// The backoff that will be slept before the next attempt, or `None` if
    /// this was the last permitted attempt.
    pub next_backoff: Option<Duration>,
}

impl Retry {
    /// Sets the backoff duration for the first retry (the initial attempt is
    /// always immediate).
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the integer multiplier applied to the backoff after every
    /// attempt.
    pub fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Caps the backoff so it never exceeds `max`, turning unbounded
    /// exponential growth into a bounded one, e.g. 32s.
    pub fn clamp_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Gives up and returns the last error after `tries` attempts.
    pub fn max_tries(mut self, tries: usize) -> Self {
        self.max_tries = tries;
        self
    }

    /// Disables jitter, for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calls `f` until it returns `Ok`, sleeping with exponential backoff
    /// between attempts. Returns the last `Err` if `max_tries` is exhausted;
    /// with the default unbounded `max_tries`, this future only resolves on
    /// success.
    pub async fn retry_async<F, Fut, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff = self.initial_backoff;
        let mut i = 0;
        loop {
            i += 1;
            let last_attempt = i >= self.max_tries;
            let next_backoff = if last_attempt {
                None
            } else {
                Some(self.jittered(backoff))
            };
            match f(RetryState { i, next_backoff }).await {
                Ok(t) => return Ok(t),
                Err(e) if last_attempt => return Err(e),
                Err(_) => {
                    tokio::time::sleep(next_backoff.unwrap()).await;
                    backoff = std::cmp::min(backoff * self.multiplier, self.max_backoff);
                }
            }
        }
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        if !self.jitter {
            return backoff;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.0);
        backoff.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_async_succeeds_eventually() {
        let attempts = AtomicUsize::new(0);
        let result = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .without_jitter()
            .retry_async(|_state| {
                let attempts = &attempts;
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn retry_async_gives_up_after_max_tries() {
        let result: Result<(), _> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(2)
            .retry_async(|_state| async { Err::<(), _>("always fails") })
            .await;
        assert_eq!(result, Err("always fails"));
    }
}
