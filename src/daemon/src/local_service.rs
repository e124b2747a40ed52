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

//! The real `Uncloud` service implementation: what [`uncloud_rpc::LocalBackend`]
//! actually dials into on this machine's internal domain socket. Every
//! method here answers in the always-`metadata: None` one-to-one shape
//! (§3 "absent in one-to-one mode"); the Director's `MetadataInjector` is
//! the only thing ever allowed to attach a `ResponseMetadata`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bollard::container::LogsOptions;
use bollard::Docker;
use chrono::DateTime;
use futures::stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use uncloud_machine::Store;
use uncloud_proto::uncloud_server::Uncloud;
use uncloud_proto::{
    ImageInfo, InspectImageReply, InspectImageRequest, InspectImageResponse, ListServicesReply,
    ListServicesRequest, ListServicesResponse, LogEntry, ServiceInfo, StreamLogsRequest,
};

pub struct LocalUncloudService<S> {
    store: Arc<S>,
    docker: Docker,
    local_machine_id: String,
}

impl<S> LocalUncloudService<S> {
    pub fn new(store: Arc<S>, docker: Docker, local_machine_id: String) -> Self {
        LocalUncloudService {
            store,
            docker,
            local_machine_id,
        }
    }
}

#[tonic::async_trait]
impl<S> Uncloud for LocalUncloudService<S>
where
    S: Store + 'static,
{
    async fn list_services(
        &self,
        _request: Request<ListServicesRequest>,
    ) -> Result<Response<ListServicesResponse>, Status> {
        let records = self
            .store
            .containers()
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let mut by_service: HashMap<String, (String, u32)> = HashMap::new();
        for record in records
            .iter()
            .filter(|r| r.machine_id == self.local_machine_id)
        {
            let entry = by_service
                .entry(record.container.service_id.clone())
                .or_insert_with(|| (record.container.service_name.clone(), 0));
            entry.1 += 1;
        }

        let services = by_service
            .into_iter()
            .map(|(id, (name, replicas))| ServiceInfo { id, name, replicas })
            .collect();

        Ok(Response::new(ListServicesResponse {
            messages: vec![ListServicesReply {
                metadata: None,
                services,
            }],
        }))
    }

    async fn inspect_image(
        &self,
        request: Request<InspectImageRequest>,
    ) -> Result<Response<InspectImageResponse>, Status> {
        let name = request.into_inner().name;
        let summary = self
            .docker
            .inspect_image(&name)
            .await
            .map_err(|err| Status::not_found(format!("image {name:?}: {err}")))?;

        let image = ImageInfo {
            id: summary.id.unwrap_or_default(),
            name,
            size_bytes: summary.size.unwrap_or_default(),
        };

        Ok(Response::new(InspectImageResponse {
            messages: vec![InspectImageReply {
                metadata: None,
                image: Some(image),
            }],
        }))
    }

    type StreamLogsStream = Pin<Box<dyn Stream<Item = Result<LogEntry, Status>> + Send + 'static>>;

    async fn stream_logs(
        &self,
        request: Request<StreamLogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let service = request.into_inner().service;
        let records = self
            .store
            .containers()
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let container_ids: Vec<(String, String)> = records
            .into_iter()
            .filter(|r| r.machine_id == self.local_machine_id && r.container.service_name == service)
            .map(|r| (r.container.id, r.container.service_id))
            .collect();

        if container_ids.is_empty() {
            return Ok(Response::new(Box::pin(futures::stream::empty())));
        }

        let docker = self.docker.clone();
        let streams = container_ids.into_iter().map(move |(container_id, replica)| {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                timestamps: true,
                ..Default::default()
            };
            docker
                .logs(&container_id, Some(options))
                .map(move |item| log_output_to_entry(item, &replica))
        });

        let merged = futures::stream::select_all(streams);
        Ok(Response::new(Box::pin(merged)))
    }
}

fn log_output_to_entry(
    item: Result<bollard::container::LogOutput, bollard::errors::Error>,
    replica: &str,
) -> Result<LogEntry, Status> {
    let output = item.map_err(|err| Status::unavailable(err.to_string()))?;
    let (stream, bytes) = match output {
        bollard::container::LogOutput::StdOut { message } => ("stdout", message),
        bollard::container::LogOutput::StdErr { message } => ("stderr", message),
        bollard::container::LogOutput::Console { message } => ("stdout", message),
        bollard::container::LogOutput::StdIn { message } => ("stdout", message),
    };
    let (timestamp_unix_nanos, message) = split_docker_timestamp(&bytes);
    Ok(LogEntry {
        metadata: None,
        timestamp_unix_nanos,
        replica: replica.to_string(),
        stream: stream.to_string(),
        message,
    })
}

/// Docker's `timestamps: true` option prefixes each log line with an
/// RFC3339-nano timestamp and a single space. Splits that prefix off and
/// parses it; falls back to a zero timestamp (ordered last within its
/// machine, never dropped) if a line is somehow missing it.
fn split_docker_timestamp(bytes: &[u8]) -> (i64, Vec<u8>) {
    let text = String::from_utf8_lossy(bytes);
    match text.find(' ') {
        Some(idx) => {
            let (prefix, rest) = text.split_at(idx);
            match parse_rfc3339_nanos(prefix) {
                Some(nanos) => (nanos, rest[1..].as_bytes().to_vec()),
                None => (0, bytes.to_vec()),
            }
        }
        None => (0, bytes.to_vec()),
    }
}

/// Parses the RFC3339-nano timestamp Docker's `timestamps: true` option
/// prefixes each log line with (`2023-05-01T12:34:56.123456789Z`).
pub(crate) fn parse_rfc3339_nanos(s: &str) -> Option<i64> {
    Some(DateTime::parse_from_rfc3339(s).ok()?.timestamp_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_style_timestamp() {
        let nanos = parse_rfc3339_nanos("2023-05-01T12:34:56.123456789Z").unwrap();
        // 2023-05-01T12:34:56Z is 1682944496 seconds since the epoch.
        assert_eq!(nanos, 1_682_944_496_123_456_789);
    }

    #[test]
    fn splits_prefix_from_message() {
        let line = b"2023-05-01T12:34:56.000000000Z hello world".to_vec();
        let (nanos, message) = split_docker_timestamp(&line);
        assert!(nanos > 0);
        assert_eq!(message, b"hello world");
    }
}
