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

//! `uncloudd`: the long-lived per-machine orchestrator process. Wires
//! together the fan-out RPC proxy (§4.1), the local Docker container
//! watcher that feeds its inventory, and the ingress reconciler (§4.2) into
//! one running node.

mod config;
mod http;
mod local_service;
mod membership;
mod rpc_listener;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;

use uncloud_ingress::{IngressConfig, IngressReconciler};
use uncloud_machine::{MachineInfo, SqliteStore, StoreMachineMapper};
use uncloud_ore::cli::{self, CliConfig};
use uncloud_ore::error::ErrorExt;
use uncloud_rpc::{Director, LocalBackend};

use config::Args;
use local_service::LocalUncloudService;

#[tokio::main]
async fn main() {
    let args: Args = cli::parse_args(CliConfig {
        env_prefix: Some("UNCLOUDD_"),
        ..Default::default()
    });

    uncloud_ore::panic::set_abort_on_panic();
    let tracing_handle = match uncloud_ore::logging::init_logging("uncloud=info") {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(args, tracing_handle).await {
        tracing::error!("{}", err.display_with_causes());
        std::process::exit(1);
    }
}

async fn run(args: Args, tracing_handle: uncloud_ore::logging::TracingHandle) -> Result<(), anyhow::Error> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data directory {}", args.data_dir.display()))?;

    let store = Arc::new(
        SqliteStore::open(args.machine_db_path()).context("opening machine database")?,
    );
    store
        .upsert_machine(MachineInfo {
            id: args.machine_id.clone(),
            name: args.machine_name.clone(),
            network_address: args.network_address,
        })
        .await
        .context("registering local machine")?;

    let docker = connect_docker(&args).context("connecting to the local Docker daemon")?;

    let cancellation = CancellationToken::new();

    let watcher_handle = uncloud_ore::task::spawn(
        || "container-watcher",
        watcher::run(
            docker.clone(),
            Arc::clone(&store),
            args.machine_id.clone(),
            cancellation.clone(),
        ),
    );

    let local_service = LocalUncloudService::new(Arc::clone(&store), docker, args.machine_id.clone());
    let local_socket_path = args.local_service_socket_path();
    let local_service_handle = uncloud_ore::task::spawn(|| "local-uncloud-service", {
        let local_socket_path = local_socket_path.clone();
        async move {
            if let Err(err) = rpc_listener::serve_local_service(&local_socket_path, local_service).await {
                tracing::error!(%err, "local uncloud service listener exited");
            }
        }
    });

    let local_backend = uncloud_ore::retry::Retry::default()
        .clamp_backoff(Duration::from_secs(2))
        .max_tries(50)
        .retry_async(|_state| {
            let socket_path = local_socket_path.clone();
            async move { LocalBackend::connect(socket_path).await }
        })
        .await
        .context("connecting to the local uncloud service")?;

    let mapper = Arc::new(StoreMachineMapper::new(Arc::clone(&store), args.machine_id.clone()));
    let director = Arc::new(Director::new(Arc::new(local_backend), mapper, args.rpc_overlay_port));

    let membership_handle = uncloud_ore::task::spawn(|| "membership-poll", {
        let store = Arc::clone(&store);
        let director = Arc::clone(&director);
        let cancellation = cancellation.clone();
        async move {
            membership::run(
                store,
                director,
                Duration::from_secs(args.membership_poll_secs.max(1)),
                cancellation,
            )
            .await
        }
    });

    let ingress_config = IngressConfig {
        config_dir: args.ingress_config_dir.clone(),
        admin_socket_path: args.ingress_admin_socket_path.clone(),
        config_group: args.ingress_config_group.clone(),
        local_machine_id: args.machine_id.clone(),
    };
    let admin = uncloud_ingress::CaddyAdminClient::new(ingress_config.admin_socket_path.clone());
    let reconciler = IngressReconciler::new(Arc::clone(&store), admin, ingress_config);
    let reconciler_handle = uncloud_ore::task::spawn(|| "ingress-reconciler", {
        let cancellation = cancellation.clone();
        async move {
            if let Err(err) = reconciler.run(cancellation).await {
                tracing::error!(%err, "ingress reconciler exited");
            }
        }
    });

    let metrics_registry = Arc::new(Registry::new());
    let http_handle = uncloud_ore::task::spawn(|| "internal-http-server", {
        let registry = Arc::clone(&metrics_registry);
        let tracing_handle = tracing_handle.clone();
        let listen_addr = args.internal_http_listen_addr;
        async move {
            if let Err(err) = http::serve(listen_addr, registry, tracing_handle).await {
                tracing::error!(%err, "internal HTTP server exited");
            }
        }
    });

    tracing::info!(
        machine_id = %args.machine_id,
        machine_name = %args.machine_name,
        "uncloudd started"
    );

    let public_socket_path = args.public_socket_path();
    let overlay_addr = std::net::SocketAddr::from((args.network_address, args.rpc_overlay_port));
    let director_result = rpc_listener::serve_director(&public_socket_path, overlay_addr, director).await;

    cancellation.cancel();
    let _ = tokio::join!(
        watcher_handle,
        local_service_handle,
        membership_handle,
        reconciler_handle,
        http_handle,
    );

    director_result.context("director listener exited")
}

fn connect_docker(args: &Args) -> Result<bollard::Docker, bollard::errors::Error> {
    match &args.docker_host {
        Some(host) if host.starts_with("unix://") => {
            bollard::Docker::connect_with_unix(host, 120, bollard::API_DEFAULT_VERSION)
        }
        Some(host) => {
            tracing::warn!(%host, "non-unix DOCKER_HOST is not specially handled; falling back to local defaults");
            bollard::Docker::connect_with_local_defaults()
        }
        None => bollard::Docker::connect_with_local_defaults(),
    }
}
