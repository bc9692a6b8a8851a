//! Router configuration loading.
//!
//! The configuration is a line-oriented `key: value` file:
//!
//! ```text
//! hostIp: 192.168.4.2
//! myIp: 1.1.0.1
//! prefix: 1.1.0.0/16
//! neighbor: 1.2.0.1 192.168.7.1 .01
//! neighbor: 1.3.0.1 192.168.2.4 .05
//! destination: 1.2.0.1
//! destination: 1.3.0.1
//! ```
//!
//! `hostIp` is the substrate-layer bind address, `myIp` the overlay address
//! of this router. `prefix` lines list the locally advertised prefixes.
//! Each `neighbor` line names a neighbor's overlay address, the host it
//! runs on, and the initial link delay in seconds; the order of neighbor
//! lines defines the link indexing used everywhere else. `destination`
//! lines feed the test traffic source only.
//!
//! Loading produces an immutable [`Config`] handed to each component at
//! construction. All configuration errors are fatal at startup.

use crate::addr::{AddrError, OverlayAddr, Prefix};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config line {line_no} has no key: {line:?}")]
    MalformedLine { line_no: usize, line: String },

    #[error("config line {line_no}: {source}")]
    BadAddress {
        line_no: usize,
        source: AddrError,
    },

    #[error("config line {line_no}: bad neighbor entry {line:?}")]
    BadNeighbor { line_no: usize, line: String },

    #[error("config line {line_no}: cannot resolve host {host:?}")]
    UnresolvableHost { line_no: usize, host: String },

    #[error("missing required key {0:?}")]
    MissingKey(&'static str),
}

/// A configured neighbor of this router.
///
/// The position of a neighbor in [`Config::neighbors`] is its link index.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborInfo {
    /// The neighbor's address in the overlay network.
    pub overlay_ip: OverlayAddr,
    /// The host the neighbor's substrate binds to.
    pub host_ip: IpAddr,
    /// Initial link delay in seconds.
    pub delay: f64,
}

/// Immutable router configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Substrate-layer bind address.
    pub host_ip: IpAddr,
    /// This router's overlay address.
    pub my_ip: OverlayAddr,
    /// Prefixes this router advertises.
    pub prefixes: Vec<Prefix>,
    /// Neighbors, in link-index order.
    pub neighbors: Vec<NeighborInfo>,
    /// Overlay addresses the traffic source sends test packets to.
    pub destinations: Vec<OverlayAddr>,
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&contents)
    }

    /// Parse configuration text.
    ///
    /// Unknown keys are ignored; a non-empty line without a `:` separator
    /// is an error. `hostIp` and `myIp` are required.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut host_ip = None;
        let mut my_ip = None;
        let mut prefixes = Vec::new();
        let mut neighbors = Vec::new();
        let mut destinations = Vec::new();

        for (idx, raw) in contents.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) =
                line.split_once(':')
                    .ok_or_else(|| ConfigError::MalformedLine {
                        line_no,
                        line: line.to_string(),
                    })?;
            let value = value.trim();

            match key.trim() {
                "hostIp" => host_ip = Some(resolve_host(value, line_no)?),
                "myIp" => {
                    my_ip = Some(value.parse().map_err(|source| ConfigError::BadAddress {
                        line_no,
                        source,
                    })?)
                }
                "prefix" => {
                    prefixes.push(value.parse().map_err(|source| ConfigError::BadAddress {
                        line_no,
                        source,
                    })?)
                }
                "neighbor" => neighbors.push(parse_neighbor(value, line_no)?),
                "destination" => destinations.push(value.parse().map_err(|source| {
                    ConfigError::BadAddress { line_no, source }
                })?),
                _ => {} // unrecognized keys are ignored
            }
        }

        Ok(Config {
            host_ip: host_ip.ok_or(ConfigError::MissingKey("hostIp"))?,
            my_ip: my_ip.ok_or(ConfigError::MissingKey("myIp"))?,
            prefixes,
            neighbors,
            destinations,
        })
    }
}

/// Parse a `neighbor` value: `<overlayIp> <hostIp> <delay>`.
fn parse_neighbor(value: &str, line_no: usize) -> Result<NeighborInfo, ConfigError> {
    let bad = || ConfigError::BadNeighbor {
        line_no,
        line: value.to_string(),
    };

    let mut fields = value.split_whitespace();
    let overlay_ip = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(bad)?;
    let host = fields.next().ok_or_else(bad)?;
    let delay: f64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(bad)?;
    if fields.next().is_some() {
        return Err(bad());
    }

    Ok(NeighborInfo {
        overlay_ip,
        host_ip: resolve_host(host, line_no)?,
        delay,
    })
}

/// Resolve a host given either as a literal IP or as a name.
fn resolve_host(host: &str, line_no: usize) -> Result<IpAddr, ConfigError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| ConfigError::UnresolvableHost {
            line_no,
            host: host.to_string(),
        })
}
