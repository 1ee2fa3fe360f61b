//! Connection tracking cleanup.
//!
//! A redirect rule only applies to new flows. The kernel keeps routing a
//! client through an existing tracked flow until that entry times out, so
//! the relay deletes it as soon as the redirect is in place.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;

use crate::error::Result;

pub use cli::ConntrackCli;

mod cli;

/// Last octet of the redirect target address on the client's network.
pub const DEFAULT_FLOW_OCTET: u8 = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowDescriptor {
    pub orig_src: IpAddr,
    pub orig_dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowDescriptor {
    /// The UDP flow between the redirect target on `client`'s network
    /// (client address with its last octet set to `last_octet`) and the
    /// client itself, using `port` on both legs.
    pub fn for_client(client: SocketAddr, last_octet: u8, port: u16) -> FlowDescriptor {
        let orig_src = match client.ip() {
            IpAddr::V4(ip) => {
                let mut octets = ip.octets();
                octets[3] = last_octet;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpAddr::V6(ip) => {
                let mut octets = ip.octets();
                octets[15] = last_octet;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        Self {
            orig_src,
            orig_dst: client.ip(),
            src_port: port,
            dst_port: port,
        }
    }
    pub fn is_ipv4(&self) -> bool {
        self.orig_src.is_ipv4()
    }
}

impl fmt::Display for FlowDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "udp {} sport={} -> {} dport={}",
            self.orig_src, self.src_port, self.orig_dst, self.dst_port
        )
    }
}

#[async_trait]
pub trait ConntrackController: Send + Sync {
    /// Drop every tracked flow on the host.
    async fn flush_all(&self) -> Result<()>;
    async fn delete_flow(&self, flow: &FlowDescriptor) -> Result<()>;
}
