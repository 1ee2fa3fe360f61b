//! Destination NAT for resolved sessions.
//!
//! Once an upstream wins a session the client's later datagrams must reach
//! that upstream without passing through the relay. A [`NatController`]
//! installs one [`RedirectRule`] per client for this.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::{Error, Result};

pub use iptables::IptablesNat;

mod iptables;

/// Chain the relay owns when none is configured.
pub const DEFAULT_CHAIN: &str = "FUNNEL_PREROUTING";

/// `-p udp -s <client ip> --sport <client port> -j DNAT --to-destination <upstream>`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RedirectRule {
    pub client: SocketAddr,
    pub upstream: SocketAddr,
}

impl RedirectRule {
    pub fn new(client: SocketAddr, upstream: SocketAddr) -> Result<RedirectRule> {
        if client.is_ipv4() != upstream.is_ipv4() {
            return Err(Error::AddressFamilyMismatch { client, upstream });
        }
        Ok(Self { client, upstream })
    }
    pub fn is_ipv4(&self) -> bool {
        self.client.is_ipv4()
    }
    /// Match and target arguments, without the table/operation prefix.
    pub fn rule_spec(&self) -> Vec<String> {
        vec![
            "-p".into(),
            "udp".into(),
            "-s".into(),
            self.client.ip().to_string(),
            "--sport".into(),
            self.client.port().to_string(),
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            self.upstream.to_string(),
        ]
    }
}

impl fmt::Display for RedirectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp {} -> {}", self.client, self.upstream)
    }
}

#[async_trait]
pub trait NatController: Send + Sync {
    /// Append a redirect for `client` unless an identical rule already exists.
    async fn install_redirect(&self, client: SocketAddr, upstream: SocketAddr) -> Result<()>;
    /// Remove every rule from the relay's chain.
    async fn clear(&self) -> Result<()>;
}
