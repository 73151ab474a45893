//! Publisher and subscriber configuration
//!
//! Plain structs with defaults matching the original feed deployment;
//! the binaries fill them from CLI flags, embedders construct them
//! directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{
    DEFAULT_END_SESSION_WAIT, DEFAULT_MULTICAST_ADDR, DEFAULT_PORT, DEFAULT_PPMS,
};
use crate::error::{MoldError, Result};

fn default_group() -> Ipv4Addr {
    Ipv4Addr::from(DEFAULT_MULTICAST_ADDR)
}

/// Replace a non-multicast group address with the safe default
fn sanitize_group(group: Ipv4Addr) -> Ipv4Addr {
    if group.is_multicast() {
        group
    } else {
        warn!("{} is not a multicast address, using {}", group, default_group());
        default_group()
    }
}

/// Parse one `host[:port]` retransmit-server entry
fn parse_server(entry: &str, default_port: u16) -> Result<SocketAddr> {
    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| MoldError::config(format!("bad port in {entry:?}")))?;
            (host, port)
        }
        None => (entry, default_port),
    };
    let ip = host
        .parse::<IpAddr>()
        .map_err(|_| MoldError::config(format!("bad host in {entry:?}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// Settings for the publishing side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Multicast group to stream to
    pub group: Ipv4Addr,
    /// UDP port of the feed
    pub port: u16,
    /// IPv4 address of the egress NIC; kernel default when unset
    pub interface: Option<Ipv4Addr>,
    /// Deliver the stream to subscribers on this host too
    pub loopback: bool,
    /// Session tag stamped on every packet
    pub session: String,
    /// Pace in packets per millisecond
    pub ppms: usize,
    /// Grace seconds between the end-of-session sentinel and exit
    pub end_session_wait: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: DEFAULT_PORT,
            interface: None,
            loopback: false,
            session: String::new(),
            ppms: DEFAULT_PPMS,
            end_session_wait: DEFAULT_END_SESSION_WAIT,
        }
    }
}

impl PublisherConfig {
    /// The group actually used: the configured one if multicast, else
    /// the safe default
    pub fn effective_group(&self) -> Ipv4Addr {
        sanitize_group(self.group)
    }
}

/// Settings for the subscribing side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Multicast group to join
    pub group: Ipv4Addr,
    /// UDP port of the feed
    pub port: u16,
    /// IPv4 address of the NIC to join on; kernel default when unset
    pub interface: Option<Ipv4Addr>,
    /// `host[:port]` entries to round-robin retransmit requests to;
    /// empty means adopt the first packet's sender
    pub retransmit_servers: Vec<String>,
    /// First sequence expected, 1-based
    pub next_sequence: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: DEFAULT_PORT,
            interface: None,
            retransmit_servers: Vec::new(),
            next_sequence: 1,
        }
    }
}

impl SubscriberConfig {
    /// The group actually joined: the configured one if multicast, else
    /// the safe default
    pub fn effective_group(&self) -> Ipv4Addr {
        sanitize_group(self.group)
    }

    /// Resolve the retransmit-server entries; a missing port defaults to
    /// the feed port
    pub fn retransmit_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.retransmit_servers
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| parse_server(s, self.port))
            .collect()
    }
}
