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

//! The container-label schema of §6: ingress ports are encoded as a single
//! comma-separated label; service identity and management eligibility are
//! plain string labels.

use std::fmt;
use std::str::FromStr;

/// `uncloud.service.ports`: `[host:]published:container/protocol[@mode]`,
/// comma-separated.
pub const PORTS_LABEL: &str = "uncloud.service.ports";
/// `uncloud.service.id`.
pub const SERVICE_ID_LABEL: &str = "uncloud.service.id";
/// `uncloud.service.name`.
pub const SERVICE_NAME_LABEL: &str = "uncloud.service.name";
/// `uncloud.managed`: marks resources eligible for cleanup.
pub const MANAGED_LABEL: &str = "uncloud.managed";
/// Opaque per-service reverse-proxy config block, not named by the spec's
/// glossary but required by §4.2 steps 6–7 to locate a container's custom
/// config.
pub const CUSTOM_CONFIG_LABEL: &str = "uncloud.ingress.custom-config";

/// One of the four transport protocols an ingress port can be published as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ParseError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// Whether a published port is routed through the cluster's ingress
/// (reverse-proxied, the default) or bound directly on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ingress,
    Host,
}

impl FromStr for Mode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(Mode::Ingress),
            "host" => Ok(Mode::Host),
            other => Err(ParseError::UnknownMode(other.to_string())),
        }
    }
}

/// One parsed entry of the `uncloud.service.ports` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// The hostname this port is published as, when `protocol` is `http` or
    /// `https`. Absent (empty) for `tcp`/`udp`, which have no hostname
    /// concept.
    pub hostname: String,
    pub published_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
    pub mode: Mode,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("port spec {0:?} is missing the published:container port pair")]
    MissingPorts(String),
    #[error("port spec {0:?} has a non-numeric port")]
    InvalidPort(String),
    #[error("port spec {0:?} is missing a /protocol suffix")]
    MissingProtocol(String),
    #[error("unknown protocol {0:?}, expected http, https, tcp, or udp")]
    UnknownProtocol(String),
    #[error("unknown mode {0:?}, expected ingress or host")]
    UnknownMode(String),
}

/// Parses the full value of a `uncloud.service.ports` label: a
/// comma-separated list of `[host:]published:container/protocol[@mode]`
/// entries.
///
/// A hostname is required for `http`/`https` entries (it names the
/// externally published hostname) and is rejected for `tcp`/`udp`, which
/// have no such concept.
pub fn parse_ports(label_value: &str) -> Result<Vec<Port>, ParseError> {
    label_value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_one)
        .collect()
}

fn parse_one(spec: &str) -> Result<Port, ParseError> {
    let (ports_and_protocol, mode) = match spec.split_once('@') {
        Some((rest, mode)) => (rest, Mode::from_str(mode)?),
        None => (spec, Mode::Ingress),
    };

    let (host_and_ports, protocol) = ports_and_protocol
        .split_once('/')
        .ok_or_else(|| ParseError::MissingProtocol(spec.to_string()))?;
    let protocol = Protocol::from_str(protocol)?;

    let parts: Vec<&str> = host_and_ports.split(':').collect();
    let (hostname, published, container) = match parts.as_slice() {
        [published, container] => ("", *published, *container),
        [hostname, published, container] => (*hostname, *published, *container),
        _ => return Err(ParseError::MissingPorts(spec.to_string())),
    };

    let published_port = published
        .parse()
        .map_err(|_| ParseError::InvalidPort(spec.to_string()))?;
    let container_port = container
        .parse()
        .map_err(|_| ParseError::InvalidPort(spec.to_string()))?;

    Ok(Port {
        hostname: hostname.to_string(),
        published_port,
        container_port,
        protocol,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_http_entry() {
        let ports = parse_ports("app.example.com:8080:80/http").unwrap();
        assert_eq!(
            ports,
            vec![Port {
                hostname: "app.example.com".to_string(),
                published_port: 8080,
                container_port: 80,
                protocol: Protocol::Http,
                mode: Mode::Ingress,
            }]
        );
    }

    #[test]
    fn parses_multiple_comma_separated_entries() {
        let ports = parse_ports("8080:80/http,9000:9000/tcp@host").unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].protocol, Protocol::Http);
        assert_eq!(ports[1].protocol, Protocol::Tcp);
        assert_eq!(ports[1].mode, Mode::Host);
    }

    #[test]
    fn rejects_missing_protocol() {
        let err = parse_ports("8080:80").unwrap_err();
        assert!(matches!(err, ParseError::MissingProtocol(_)));
    }

    #[test]
    fn rejects_non_numeric_port() {
        let err = parse_ports("abc:80/tcp").unwrap_err();
        assert!(matches!(err, ParseError::InvalidPort(_)));
    }

    #[test]
    fn blank_label_value_yields_no_ports() {
        assert_eq!(parse_ports("").unwrap(), Vec::new());
    }
}
