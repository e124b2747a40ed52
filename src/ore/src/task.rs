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

//! A thin wrapper around [`tokio::spawn`] that requires every task to carry
//! a human-readable name.
//!
//! The name is taken lazily (`FnOnce() -> S` rather than a plain string) so
//! that call sites that never hit an error path don't pay for formatting a
//! name nobody will read; it shows up in panic messages and, if the binary
//! was built with `tokio_unstable`, in `tokio-console`.

use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns `future` as a new tokio task named by `name`.
pub fn spawn<Name, Fut>(name: impl FnOnce() -> Name, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = name().as_ref().to_string();
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new()
            .name(&name)
            .spawn(future)
            .expect("spawning a task should never fail")
    }
    #[cfg(not(tokio_unstable))]
    {
        let _ = &name;
        tokio::spawn(future)
    }
}

/// Like [`spawn`], but for blocking work handed to tokio's blocking thread
/// pool (e.g. a synchronous rusqlite call in [`crate`]'s callers).
pub fn spawn_blocking<Name, F, R>(name: impl FnOnce() -> Name, f: F) -> JoinHandle<R>
where
    Name: AsRef<str>,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let name = name().as_ref().to_string();
    let _ = &name;
    tokio::task::spawn_blocking(f)
}
