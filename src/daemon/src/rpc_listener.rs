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

//! Binds the two listeners every daemon runs (§4.1 "Backend resolution"):
//! the internal domain socket the real `Uncloud` implementation answers on
//! (what `LocalBackend` dials), and the `Director`'s own public surface —
//! a domain socket for local clients (the `uncloud` CLI) plus an overlay
//! TCP listener peers proxy into.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::service::make_service_fn;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};

use uncloud_machine::{MachineMapper, Store};
use uncloud_proto::uncloud_server::UncloudServer;
use uncloud_rpc::{Backend, Director, DirectorService};

use crate::local_service::LocalUncloudService;

/// Serves the real `Uncloud` implementation on `socket_path` until the
/// process exits. Removes any stale socket file left behind by a previous
/// run before binding.
pub async fn serve_local_service<S>(
    socket_path: &Path,
    service: LocalUncloudService<S>,
) -> Result<(), anyhow::Error>
where
    S: Store + 'static,
{
    remove_stale_socket(socket_path)?;
    let listener = UnixListener::bind(socket_path)?;
    tonic::transport::Server::builder()
        .add_service(UncloudServer::new(service))
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await?;
    Ok(())
}

/// Serves the `Director` on both a public domain socket and an overlay TCP
/// port, concurrently, until either fails.
pub async fn serve_director<L, M>(
    public_socket_path: &Path,
    overlay_addr: SocketAddr,
    director: Arc<Director<L, M>>,
) -> Result<(), anyhow::Error>
where
    L: Backend + 'static,
    M: MachineMapper + 'static,
{
    remove_stale_socket(public_socket_path)?;
    let unix_listener = UnixListener::bind(public_socket_path)?;
    let tcp_listener = TcpListener::bind(overlay_addr).await?;

    let unix_service = DirectorService::new(Arc::clone(&director));
    let tcp_service = DirectorService::new(director);

    let unix_server = hyper::Server::builder(hyper::server::accept::from_stream(
        UnixListenerStream::new(unix_listener),
    ))
    .serve(make_service_fn(move |_conn| {
        let service = unix_service.clone();
        async move { Ok::<_, std::convert::Infallible>(service) }
    }));

    let tcp_server = hyper::Server::builder(hyper::server::accept::from_stream(
        TcpListenerStream::new(tcp_listener),
    ))
    .serve(make_service_fn(move |_conn| {
        let service = tcp_service.clone();
        async move { Ok::<_, std::convert::Infallible>(service) }
    }));

    tokio::try_join!(
        async { unix_server.await.map_err(anyhow::Error::from) },
        async { tcp_server.await.map_err(anyhow::Error::from) },
    )?;
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<(), anyhow::Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
