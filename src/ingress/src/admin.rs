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

//! A thin client for the reverse proxy's admin interface (§6 "Reverse-proxy
//! configuration file"): `POST /adapt`, `POST /load`, and
//! `GET /reverse_proxy/upstreams`, all reached over a local domain socket.
//! Dialing follows the same `UnixStream::connect` pattern the teacher uses
//! for its own domain-socket transport (`src/service/src/grpc.rs`), wrapped
//! here in a `hyper::client::connect::Connect` implementation since this
//! client speaks plain HTTP/1.1 rather than gRPC.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Uri};
use hyper::client::connect::{Connected, Connection};
use hyper::client::Client;
use hyper::Body;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixStream;
use tower::Service;

use crate::error::ReverseProxyAdminError;

/// The reverse-proxy admin surface the reconciler depends on, abstracted so
/// that [`crate::reconciler::IngressReconciler`] can be exercised in tests
/// against a fake implementation instead of a real Caddy process.
#[async_trait]
pub trait ReverseProxyAdmin: Send + Sync {
    /// `POST /adapt`: converts a textual Caddyfile into JSON config. Also
    /// used as the validation step in §4.2 steps 6-7: a block "validates"
    /// iff `adapt` accepts it.
    async fn adapt(&self, caddyfile: &str) -> Result<Bytes, ReverseProxyAdminError>;

    /// `POST /load`: applies a JSON config as the proxy's running
    /// configuration (the hot-load of §4.2 step 8).
    async fn load(&self, json_config: Bytes) -> Result<(), ReverseProxyAdminError>;

    /// The liveness probe of §4.2 step 8 ("ask the admin interface whether
    /// the proxy is currently reachable").
    async fn probe_reachable(&self) -> bool;
}

/// A `hyper` connector that ignores the URI entirely and always dials the
/// same Unix domain socket. `hyper::Client` still requires a URI on every
/// request, so callers address this client with throwaway
/// `http://localhost/...` URIs.
#[derive(Clone)]
struct UnixConnector {
    socket_path: PathBuf,
}

impl Service<Uri> for UnixConnector {
    type Response = UnixConnection;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let socket_path = self.socket_path.clone();
        Box::pin(async move { Ok(UnixConnection(UnixStream::connect(socket_path).await?)) })
    }
}

struct UnixConnection(UnixStream);

impl Connection for UnixConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for UnixConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Speaks to the reverse proxy's admin API over a fixed Unix domain socket.
pub struct CaddyAdminClient {
    client: Client<UnixConnector, Body>,
}

impl CaddyAdminClient {
    pub fn new(socket_path: PathBuf) -> Self {
        let connector = UnixConnector { socket_path };
        CaddyAdminClient {
            client: Client::builder().build(connector),
        }
    }

    async fn send(&self, request: Request<Body>) -> Result<Bytes, ReverseProxyAdminError> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| ReverseProxyAdminError::Unreachable(err.to_string()))?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| ReverseProxyAdminError::Unreachable(err.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            let reason = String::from_utf8_lossy(&body).into_owned();
            Err(ReverseProxyAdminError::Rejected(reason))
        }
    }
}

#[async_trait]
impl ReverseProxyAdmin for CaddyAdminClient {
    async fn adapt(&self, caddyfile: &str) -> Result<Bytes, ReverseProxyAdminError> {
        let request = Request::post(admin_uri("/adapt"))
            .header("content-type", "text/caddyfile")
            .body(Body::from(caddyfile.to_string()))
            .expect("well-formed request");
        self.send(request).await
    }

    async fn load(&self, json_config: Bytes) -> Result<(), ReverseProxyAdminError> {
        let request = Request::post(admin_uri("/load"))
            .header("content-type", "application/json")
            .body(Body::from(json_config))
            .expect("well-formed request");
        self.send(request).await.map(|_| ())
    }

    async fn probe_reachable(&self) -> bool {
        let request = Request::get(admin_uri("/reverse_proxy/upstreams"))
            .body(Body::empty())
            .expect("well-formed request");
        self.send(request).await.is_ok()
    }
}

fn admin_uri(path: &str) -> Uri {
    format!("http://localhost{path}")
        .parse()
        .expect("admin path is always a valid URI")
}
