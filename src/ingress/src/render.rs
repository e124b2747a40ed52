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

//! Builds the rendered Caddyfile string from a healthy-container snapshot
//! (§4.2 algorithm steps 2-5), plus the `upstreams([service], [port])`
//! substitution pass used inside custom config blocks (§4.2 "Template
//! variables").

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use askama::Template;
use once_cell::sync::Lazy;
use regex::Regex;

use uncloud_machine::{Container, ContainerRecord};
use uncloud_machine::label::{Mode, Protocol};

/// The fixed path external health checks use to identify which member
/// answered (§4.2 step 5).
pub const HEALTH_CHECK_PATH: &str = "/uncloud/healthz";

#[derive(Debug, Clone)]
pub struct UpstreamGroup {
    pub hostname: String,
    pub upstreams: Vec<String>,
}

#[derive(Template)]
#[template(path = "caddyfile.txt", escape = "none")]
struct CaddyfileTemplate<'a> {
    machine_id: &'a str,
    health_path: &'a str,
    http_groups: &'a [UpstreamGroup],
    https_groups: &'a [UpstreamGroup],
}

/// A container eligible for ingress routing, reduced to what rendering
/// needs: its service name (for §4.2 step 3's sort key and for the
/// `upstreams()` lookup) and its resolved `hostname -> IP:port` upstreams.
struct IngressEntry {
    service_name: String,
    container_id: String,
    network_address: Ipv6Addr,
    http: Vec<(String, u16)>,
    https: Vec<(String, u16)>,
}

/// Filters to healthy records (§4.2 step 2), parses and keeps only
/// `Mode=ingress` ports (step 4), logging and skipping unparseable labels
/// per §7's failure semantics (parsing errors never abort the cycle).
fn healthy_ingress_entries(records: &[ContainerRecord]) -> Vec<IngressEntry> {
    let mut entries = Vec::new();
    for record in records {
        if !record.container.is_healthy() {
            continue;
        }
        let Some(addr) = record.container.network_address else {
            continue;
        };
        let ports = match record.container.ports() {
            Ok(ports) => ports,
            Err(err) => {
                tracing::warn!(
                    container_id = %record.container.id,
                    error = %err,
                    "skipping container with unparseable port label"
                );
                continue;
            }
        };
        let mut http = Vec::new();
        let mut https = Vec::new();
        for port in ports {
            if port.mode != Mode::Ingress || port.published_port == 0 || port.hostname.is_empty() {
                continue;
            }
            match port.protocol {
                Protocol::Http => http.push((port.hostname.clone(), port.container_port)),
                Protocol::Https => https.push((port.hostname.clone(), port.container_port)),
                Protocol::Tcp | Protocol::Udp => {}
            }
        }
        if http.is_empty() && https.is_empty() {
            continue;
        }
        entries.push(IngressEntry {
            service_name: record.container.service_name.clone(),
            container_id: record.container.id.clone(),
            network_address: addr,
            http,
            https,
        });
    }
    // §4.2 step 3: sort by (ServiceName, ContainerID) to guarantee
    // byte-stable output (Testable Property 5).
    entries.sort_by(|a, b| {
        (&a.service_name, &a.container_id).cmp(&(&b.service_name, &b.container_id))
    });
    entries
}

/// Groups `{Protocol, Hostname}` upstreams across all entries, preserving
/// the entries' sort order within each group (§4.2 step 4).
fn group_upstreams(
    entries: &[IngressEntry],
    select: impl Fn(&IngressEntry) -> &[(String, u16)],
) -> Vec<UpstreamGroup> {
    let mut by_host: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in entries {
        for (hostname, port) in select(entry) {
            by_host
                .entry(hostname.clone())
                .or_default()
                .push(format!("[{}]:{}", entry.network_address, port));
        }
    }
    by_host
        .into_iter()
        .map(|(hostname, upstreams)| UpstreamGroup { hostname, upstreams })
        .collect()
}

/// Renders the base configuration (§4.2 steps 2-5): the health-check route
/// plus one reverse-proxy block per HTTP/HTTPS hostname.
pub fn render_base(machine_id: &str, records: &[ContainerRecord]) -> Result<String, askama::Error> {
    let entries = healthy_ingress_entries(records);
    let http_groups = group_upstreams(&entries, |e| &e.http);
    let https_groups = group_upstreams(&entries, |e| &e.https);
    CaddyfileTemplate {
        machine_id,
        health_path: HEALTH_CHECK_PATH,
        http_groups: &http_groups,
        https_groups: &https_groups,
    }
    .render()
}

static UPSTREAMS_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{\{\s*upstreams\(\s*"([^"]*)"\s*(?:,\s*(\d+)\s*)?\)\s*\}\}"#)
        .expect("static regex is valid")
});

/// Expands every `{{upstreams("service"[, port])}}` occurrence in `text`
/// with the comma-joined list of that service's healthy container IPs
/// (optionally suffixed `:port`), per §4.2 "Template variables". A service
/// name that does not resolve to any healthy container expands to the
/// empty string, never an error — this substitution runs over untrusted,
/// opaque per-service config text and must not itself be able to fail the
/// cycle.
pub fn expand_upstreams(text: &str, records: &[ContainerRecord]) -> String {
    let entries = healthy_ingress_entries(records);
    UPSTREAMS_CALL
        .replace_all(text, |caps: &regex::Captures| {
            let service = &caps[1];
            let port: Option<u16> = caps.get(2).and_then(|m| m.as_str().parse().ok());
            let ips: Vec<String> = entries
                .iter()
                .filter(|e| e.service_name == service)
                .map(|e| match port {
                    Some(p) => format!("[{}]:{p}", e.network_address),
                    None => format!("[{}]", e.network_address),
                })
                .collect();
            ips.join(",")
        })
        .into_owned()
}

/// A "most recent container" lookup used by §4.2 steps 6-7: among all
/// containers (healthy or not — a declared custom config should apply even
/// while its container is briefly unhealthy) belonging to `service_name` on
/// `machine_id`, the one with the latest `created_unix_nanos` wins.
pub fn latest_custom_config<'a>(
    records: &'a [ContainerRecord],
    machine_id: &str,
    service_name: &str,
) -> Option<&'a Container> {
    records
        .iter()
        .filter(|r| r.machine_id == machine_id && r.container.service_name == service_name)
        .map(|r| &r.container)
        .filter(|c| c.custom_config().is_some())
        .max_by_key(|c| c.created_unix_nanos)
}

/// Like [`latest_custom_config`], but scoped to the whole cluster rather
/// than one machine: §4.2 step 7 selects "the most recent container"
/// carrying a custom config for a given *other* service, with no per-machine
/// restriction (unlike step 6's host-scoped `caddy` lookup, since a
/// non-proxy service's custom block is a property of the service, not of
/// which machine happens to run it).
pub fn latest_custom_config_any_machine<'a>(
    records: &'a [ContainerRecord],
    service_name: &str,
) -> Option<&'a Container> {
    records
        .iter()
        .map(|r| &r.container)
        .filter(|c| c.service_name == service_name && c.custom_config().is_some())
        .max_by_key(|c| c.created_unix_nanos)
}

/// Enumerates every distinct service name present in `records` other than
/// `exclude` (§4.2 step 7's "every other service"), in a stable order.
pub fn other_service_names(records: &[ContainerRecord], exclude: &str) -> Vec<String> {
    let mut names: Vec<String> = records
        .iter()
        .map(|r| r.container.service_name.clone())
        .filter(|name| name != exclude)
        .collect();
    names.sort();
    names.dedup();
    names
}
