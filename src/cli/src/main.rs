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

//! `uncloud`: a thin operator-facing client. Its command surface is
//! intentionally minimal (spec §1 Non-goals exclude the real CLI's flag
//! surface) — just enough to dial the local `Director` and exercise the
//! fan-out proxy (§4.1) and the ordered log-merge engine (§4.3) end to end.

mod config;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixStream;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tokio_util::sync::CancellationToken;

use uncloud_logs::{print, LogMergeEngine};
use uncloud_machine::{MachineMapper, MachineTarget, SqliteStore, StoreMachineMapper};
use uncloud_ore::cli::{self, CliConfig};
use uncloud_ore::error::ErrorExt;
use uncloud_proto::uncloud_client::UncloudClient;
use uncloud_proto::{InspectImageRequest, ListServicesRequest};

use config::{Args, Command, OrderMode, TargetArgs};

#[tokio::main]
async fn main() {
    let args: Args = cli::parse_args(CliConfig {
        env_prefix: Some("UNCLOUD_"),
        ..Default::default()
    });

    if uncloud_ore::logging::init_logging("uncloud=warn").is_err() {
        // The CLI is fine without structured logging; it still prints
        // operator-facing output to stdout/stderr directly.
    }

    if let Err(err) = run(args).await {
        eprintln!("error: {}", err.display_with_causes());
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    match args.command.clone() {
        Command::ListServices { target } => list_services(&args, &target).await,
        Command::InspectImage { name, target } => inspect_image(&args, &name, &target).await,
        Command::Logs { service, target, order } => logs(&args, &service, &target, order).await,
    }
}

async fn director_channel(args: &Args) -> Result<Channel, anyhow::Error> {
    let socket_path = args.public_socket_path();
    Endpoint::from_static("http://localhost")
        .connect_with_connector(tower::service_fn(move |_: http::Uri| {
            let socket_path = socket_path.clone();
            async move { UnixStream::connect(socket_path).await }
        }))
        .await
        .with_context(|| format!("connecting to {}", args.public_socket_path().display()))
}

/// Attaches the `machine`/`machines` metadata keys §4.1's routing rules
/// read, mirroring exactly what a real proxied call would carry (§6
/// "Metadata keys (inbound)").
fn apply_target<T>(request: &mut Request<T>, target: &TargetArgs) -> Result<(), anyhow::Error> {
    if let Some(machine) = &target.machine {
        insert(request, "machine", machine)?;
    }
    if let Some(machines) = &target.machines {
        insert(request, "machines", machines)?;
    }
    Ok(())
}

fn insert<T>(request: &mut Request<T>, key: &'static str, value: &str) -> Result<(), anyhow::Error> {
    let key: MetadataKey<Ascii> = MetadataKey::from_static(key);
    let value: MetadataValue<Ascii> = value
        .parse()
        .with_context(|| format!("{key:?} value {value:?} is not valid ASCII metadata"))?;
    request.metadata_mut().insert(key, value);
    Ok(())
}

async fn list_services(args: &Args, target: &TargetArgs) -> Result<(), anyhow::Error> {
    let channel = director_channel(args).await?;
    let mut client = UncloudClient::new(channel);
    let mut request = Request::new(ListServicesRequest {});
    apply_target(&mut request, target)?;

    let response = client
        .list_services(request)
        .await
        .context("ListServices call failed")?
        .into_inner();

    for reply in response.messages {
        print_peer_header(reply.metadata.as_ref());
        if reply.metadata.as_ref().map(|m| !m.error.is_empty()).unwrap_or(false) {
            continue;
        }
        for service in &reply.services {
            println!("  {}\t{}\treplicas={}", service.id, service.name, service.replicas);
        }
    }
    Ok(())
}

async fn inspect_image(args: &Args, name: &str, target: &TargetArgs) -> Result<(), anyhow::Error> {
    let channel = director_channel(args).await?;
    let mut client = UncloudClient::new(channel);
    let mut request = Request::new(InspectImageRequest { name: name.to_string() });
    apply_target(&mut request, target)?;

    let response = client
        .inspect_image(request)
        .await
        .context("InspectImage call failed")?
        .into_inner();

    for reply in response.messages {
        print_peer_header(reply.metadata.as_ref());
        if let Some(image) = &reply.image {
            println!("  id={}\tname={}\tsize_bytes={}", image.id, image.name, image.size_bytes);
        }
    }
    Ok(())
}

fn print_peer_header(metadata: Option<&uncloud_proto::ResponseMetadata>) {
    let Some(metadata) = metadata else { return };
    if metadata.machine_id.is_empty() {
        // One-to-one dispatch never populates ResponseMetadata (§3
        // "absent in one-to-one mode"); nothing to print per peer.
        return;
    }
    if !metadata.error.is_empty() {
        eprintln!("{} ({}): {}", metadata.machine_name, metadata.machine_id, metadata.error);
    } else {
        println!("{} ({}):", metadata.machine_name, metadata.machine_id);
    }
}

async fn logs(args: &Args, service: &str, target: &TargetArgs, order: OrderMode) -> Result<(), anyhow::Error> {
    let store = SqliteStore::open(args.machine_db_path())
        .with_context(|| format!("opening {}", args.machine_db_path().display()))?;
    let mapper = StoreMachineMapper::new(Arc::new(store), args.machine_id.clone());

    let targets: Vec<MachineTarget> = resolve_targets(&mapper, target).await?;
    if targets.is_empty() {
        anyhow::bail!("no machines resolved for this log query");
    }

    let source = Arc::new(uncloud_logs::source::GrpcLogSource::new(
        args.machine_id.clone(),
        args.local_service_socket_path(),
        args.rpc_overlay_port,
    ));
    let engine = LogMergeEngine::new(source);
    let cancellation = CancellationToken::new();

    let ctrl_c = {
        let cancellation = cancellation.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancellation.cancel();
        }
    };
    tokio::spawn(ctrl_c);

    let mut rx = engine.run(targets, service.to_string(), order.into(), cancellation.clone());
    while let Some(entry) = rx.recv().await {
        print::print_entry(&entry);
    }
    Ok(())
}

async fn resolve_targets(
    mapper: &StoreMachineMapper<SqliteStore>,
    target: &TargetArgs,
) -> Result<Vec<MachineTarget>, anyhow::Error> {
    if let Some(machines) = &target.machines {
        let names: Vec<String> = machines
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        return Ok(mapper.resolve_many(&names).await?);
    }
    if let Some(machine) = &target.machine {
        return Ok(vec![mapper.resolve_one(machine).await?]);
    }
    // Neither flag given: default to every cluster member, since a log
    // query naturally wants every replica wherever it runs.
    Ok(mapper.resolve_many(&[uncloud_machine::mapper::WILDCARD.to_string()]).await?)
}
