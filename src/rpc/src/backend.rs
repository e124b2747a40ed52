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

//! Backends: the polymorphic transport-plus-rewriting-policy object of §9
//! "Polymorphic backend". `LocalBackend` and `RemoteBackend` share only the
//! open/call/close surface; [`MetadataInjector`] decorates either with the
//! one-to-many response-tagging policy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::PathAndQuery;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::{info, warn};

use uncloud_proto::merge;
use uncloud_proto::ResponseMetadata;

use crate::codec::RawCodec;

/// The maximum gap between reconnection attempts (§4.1 "Remote transport").
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(15);
/// The timeout applied to a single connection attempt (§4.1 "Remote
/// transport").
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A transport to one destination (local daemon or remote peer) plus the
/// ability to close it. `Backend::call` never constructs or parses a
/// concrete protobuf message: `body` and the return value are raw,
/// already-encoded gRPC message bytes, using [`crate::codec::RawCodec`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Forwards one unary call to this backend's destination.
    async fn call(
        &self,
        path: PathAndQuery,
        metadata: MetadataMap,
        body: Bytes,
    ) -> Result<Bytes, Status>;

    /// Idempotently closes this backend. In-flight calls finish with
    /// `Canceled`; no new call may be started afterwards.
    async fn close(&self);
}

async fn connect_channel(endpoint: Endpoint) -> Result<Channel, tonic::transport::Error> {
    endpoint.connect_timeout(CONNECT_TIMEOUT).connect().await
}

/// The backend bound to this daemon's own domain socket. A singleton per
/// daemon; its lifetime is the daemon's lifetime.
pub struct LocalBackend {
    channel: Channel,
}

impl LocalBackend {
    /// Dials the local domain socket at `socket_path`. Unlike
    /// [`RemoteBackend`], this connects eagerly: the local Docker/management
    /// endpoint this backend proxies to is expected to be up whenever the
    /// daemon itself is running.
    pub async fn connect(socket_path: PathBuf) -> Result<Self, anyhow::Error> {
        let channel = Endpoint::from_static("http://localhost")
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_with_connector(tower::service_fn(move |_: http::Uri| {
                let socket_path = socket_path.clone();
                async move { UnixStream::connect(socket_path).await }
            }))
            .await?;
        Ok(LocalBackend { channel })
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn call(
        &self,
        path: PathAndQuery,
        metadata: MetadataMap,
        body: Bytes,
    ) -> Result<Bytes, Status> {
        call_unary(self.channel.clone(), path, metadata, body).await
    }

    async fn close(&self) {
        // `Channel` has no explicit close; dropping the last clone tears
        // down its connections. The daemon holds `Arc<LocalBackend>` for its
        // own lifetime, so this is a no-op kept for interface symmetry with
        // `RemoteBackend::close`.
    }
}

/// `Uninitialised -> Connecting -> Up <-> Reconnecting -> Closed`, per §4.1
/// "State machine of a RemoteBackend". `Connecting` is folded into
/// `Uninitialised`/`Reconnecting` here: the mutex held across the connect
/// attempt in [`RemoteBackend::ensure_channel`] already serialises it.
enum ConnectState {
    Uninitialised,
    Up(Channel),
    Reconnecting { retry_after: Instant, backoff: Duration },
    Closed,
}

/// A lazily connected transport to a peer daemon at `[addr]:port`, owned
/// exclusively by the Director's cache. Concurrent calls share one
/// connection attempt via the internal mutex; a failed attempt leaves the
/// backend ready to retry on the next call rather than blocking it forever.
pub struct RemoteBackend {
    addr: SocketAddr,
    state: Mutex<ConnectState>,
}

impl RemoteBackend {
    pub fn new(addr: SocketAddr) -> Self {
        RemoteBackend {
            addr,
            state: Mutex::new(ConnectState::Uninitialised),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn ensure_channel(&self) -> Result<Channel, Status> {
        let mut state = self.state.lock().await;
        match &*state {
            ConnectState::Up(channel) => return Ok(channel.clone()),
            ConnectState::Closed => {
                return Err(Status::unavailable("backend closed"));
            }
            ConnectState::Reconnecting { retry_after, .. } if Instant::now() < *retry_after => {
                return Err(Status::unavailable(format!(
                    "peer {} unreachable, backing off",
                    self.addr
                )));
            }
            ConnectState::Uninitialised | ConnectState::Reconnecting { .. } => {}
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", self.addr))
            .expect("formatted socket address is a valid URI");
        match connect_channel(endpoint).await {
            Ok(channel) => {
                info!(addr = %self.addr, "connected to peer");
                *state = ConnectState::Up(channel.clone());
                Ok(channel)
            }
            Err(err) => {
                let backoff = match &*state {
                    ConnectState::Reconnecting { backoff, .. } => {
                        std::cmp::min(*backoff * 2, MAX_RECONNECT_BACKOFF)
                    }
                    _ => Duration::from_millis(250),
                };
                warn!(addr = %self.addr, %err, ?backoff, "failed to connect to peer, backing off");
                *state = ConnectState::Reconnecting {
                    retry_after: Instant::now() + backoff,
                    backoff,
                };
                Err(Status::unavailable(format!(
                    "peer {} unreachable: {err}",
                    self.addr
                )))
            }
        }
    }

    /// Forces the next call to attempt a fresh connection, bypassing the
    /// backoff window. Used by tests and by callers that have independent
    /// evidence connectivity was restored.
    pub async fn reset_backoff(&self) {
        let mut state = self.state.lock().await;
        if matches!(&*state, ConnectState::Reconnecting { .. }) {
            *state = ConnectState::Uninitialised;
        }
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn call(
        &self,
        path: PathAndQuery,
        metadata: MetadataMap,
        body: Bytes,
    ) -> Result<Bytes, Status> {
        let channel = self.ensure_channel().await?;
        match call_unary(channel, path, metadata, body).await {
            Ok(resp) => {
                self.reset_backoff_on_success().await;
                Ok(resp)
            }
            Err(status) if status.code() == tonic::Code::Unavailable => {
                // The connection died between `ensure_channel` and the
                // call; mark it so the next call reconnects instead of
                // reusing a dead `Channel` (tonic transport channels retry
                // internally, but a torn-down peer process can still leave
                // us here).
                let mut state = self.state.lock().await;
                *state = ConnectState::Reconnecting {
                    retry_after: Instant::now(),
                    backoff: Duration::from_millis(250),
                };
                Err(status)
            }
            Err(status) => Err(status),
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        *state = ConnectState::Closed;
    }
}

impl RemoteBackend {
    async fn reset_backoff_on_success(&self) {
        let mut state = self.state.lock().await;
        if matches!(&*state, ConnectState::Reconnecting { .. }) {
            *state = ConnectState::Uninitialised;
        }
    }
}

async fn call_unary(
    channel: Channel,
    path: PathAndQuery,
    metadata: MetadataMap,
    body: Bytes,
) -> Result<Bytes, Status> {
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.map_err(|err| {
        Status::unavailable(format!("peer transport not ready: {err}"))
    })?;
    let mut request = Request::new(body);
    *request.metadata_mut() = metadata;
    let response = grpc.unary(request, path, RawCodec).await?;
    Ok(response.into_inner())
}

/// Decorates an inner [`Backend`] with the one-to-many response-tagging
/// policy of §4.1 "Metadata flow on the wire": every reply (success or
/// failure) is rewritten to carry a [`ResponseMetadata`] identifying
/// `target` before being handed back to the merge step.
pub struct MetadataInjector<B: ?Sized> {
    inner: Arc<B>,
    tag: ResponseMetadata,
}

impl<B: ?Sized> MetadataInjector<B> {
    pub fn new(inner: Arc<B>, machine_addr: String, machine_id: String, machine_name: String) -> Self {
        MetadataInjector {
            inner,
            tag: ResponseMetadata::success(machine_addr, machine_id, machine_name),
        }
    }
}

#[async_trait]
impl<B> Backend for MetadataInjector<B>
where
    B: Backend + ?Sized,
{
    async fn call(
        &self,
        path: PathAndQuery,
        metadata: MetadataMap,
        body: Bytes,
    ) -> Result<Bytes, Status> {
        match self.inner.call(path, metadata, body).await {
            Ok(response) => merge::to_reply_element(response, &self.tag)
                .map_err(|err| Status::internal(err.to_string())),
            Err(status) => {
                let failure_tag = ResponseMetadata::failure(
                    self.tag.machine_addr.clone(),
                    self.tag.machine_id.clone(),
                    self.tag.machine_name.clone(),
                    status.code() as i32,
                    status.message().to_string(),
                );
                Ok(merge::failure_element(&failure_tag))
            }
        }
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
