//! # udp-funnel - UDP rendezvous relay
//!
//! `udp-funnel` arbitrates a two-phase NAT traversal handshake between
//! clients and a fixed set of upstream servers, then rewires the host so the
//! client's later traffic skips the relay.
//!
//! ## Handshake
//!
//! - A client sends a first-phase datagram (`0x01`, session id at bytes 4..8).
//!   The funnel remembers the client under that session id and forwards the
//!   datagram unchanged to every upstream.
//! - Upstreams answer with a second-phase datagram (`0x02`, session id at bytes
//!   8..12). The first upstream to answer wins: a DNAT rule redirecting the
//!   client to it is installed, its answer is forwarded to the client, and the
//!   client's stale conntrack entry is deleted.
//!
//! ## Modules
//!
//! - [`protocol`] - handshake classification
//! - [`session`] - session id to client mapping with expiry
//! - [`nat`] - redirect rules in the kernel `nat` table
//! - [`conntrack`] - tracked flow cleanup
//! - [`funnel`] - the relay itself
//! - [`memory`] - in-process kernel tables for dry runs and tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use udp_funnel::config::FunnelConfig;
//! use udp_funnel::conntrack::ConntrackCli;
//! use udp_funnel::funnel::Funnel;
//! use udp_funnel::nat::IptablesNat;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = FunnelConfig::default().set_upstreams(vec![
//!     "169.254.4.1:8080".parse()?,
//!     "169.254.5.1:8080".parse()?,
//! ]);
//! let timeout = Duration::from_secs(5);
//! let nat = IptablesNat::open(config.nat_chain.clone(), false, timeout).await?;
//! let conntrack = ConntrackCli::open(false, timeout).await?;
//! let funnel = Funnel::new(config, Arc::new(nat), Arc::new(conntrack)).await?;
//! funnel.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conntrack;
pub mod error;
pub mod funnel;
pub mod memory;
pub mod nat;
pub mod protocol;
pub mod session;
pub mod socket;

mod command;

pub use error::{Error, Result};
pub use funnel::{Funnel, Outcome};
