use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::conntrack::DEFAULT_FLOW_OCTET;
use crate::error::{Error, Result};
use crate::nat::DEFAULT_CHAIN;
use crate::protocol::HEAD_LEN;

pub(crate) const DEFAULT_PORT: u16 = 8080;
pub(crate) const RECV_BUFFER_SIZE: usize = 10240;
pub(crate) const SESSION_IDLE_TIME: Duration = Duration::from_secs(120);
pub(crate) const SESSION_CAPACITY: usize = 65536;
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

fn de_secs<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn de_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Process-wide relay settings, fixed once the relay starts.
///
/// Loadable from JSON; durations are given as `session_idle_secs` and
/// `command_timeout_ms`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FunnelConfig {
    /// External-facing address the relay binds
    pub listen: SocketAddr,
    /// Upstreams in broadcast order
    pub upstreams: Vec<SocketAddr>,
    /// Chain in the `nat` table that holds the redirects
    pub nat_chain: String,
    /// Last octet of the stale flow's source address
    pub flow_octet: u8,
    /// Port of both legs of the stale flow, `listen`'s port when unset
    pub flow_port: Option<u16>,
    #[serde(rename = "session_idle_secs", deserialize_with = "de_secs")]
    pub session_idle_time: Duration,
    pub session_capacity: usize,
    #[serde(rename = "command_timeout_ms", deserialize_with = "de_millis")]
    pub command_timeout: Duration,
    pub recv_buffer_size: usize,
    /// Bind the socket to this interface (`SO_BINDTODEVICE`)
    pub bind_device: Option<String>,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            upstreams: Vec::new(),
            nat_chain: DEFAULT_CHAIN.to_string(),
            flow_octet: DEFAULT_FLOW_OCTET,
            flow_port: None,
            session_idle_time: SESSION_IDLE_TIME,
            session_capacity: SESSION_CAPACITY,
            command_timeout: COMMAND_TIMEOUT,
            recv_buffer_size: RECV_BUFFER_SIZE,
            bind_device: None,
        }
    }
}

impl FunnelConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<FunnelConfig> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }
    pub fn from_json(text: &str) -> Result<FunnelConfig> {
        serde_json::from_str(text).map_err(|e| Error::InvalidArgument(format!("config: {e}")))
    }
    pub fn check(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(Error::InvalidArgument("no upstream configured".into()));
        }
        let mut seen = HashSet::with_capacity(self.upstreams.len());
        for upstream in self.upstreams.iter() {
            if upstream.port() == 0 || upstream.ip().is_unspecified() {
                return Err(Error::InvalidArgument(format!(
                    "upstream {upstream} is not routable"
                )));
            }
            if upstream.is_ipv4() != self.listen.is_ipv4() {
                return Err(Error::InvalidArgument(format!(
                    "upstream {upstream} is unreachable from listen address {}",
                    self.listen
                )));
            }
            if !seen.insert(*upstream) {
                return Err(Error::InvalidArgument(format!(
                    "upstream {upstream} listed twice"
                )));
            }
        }
        if self.nat_chain.is_empty() {
            return Err(Error::InvalidArgument("nat_chain cannot be empty".into()));
        }
        if self.session_capacity == 0 {
            return Err(Error::InvalidArgument("session_capacity cannot be 0".into()));
        }
        if self.session_idle_time.is_zero() {
            return Err(Error::InvalidArgument(
                "session_idle_secs cannot be 0".into(),
            ));
        }
        if self.command_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "command_timeout_ms cannot be 0".into(),
            ));
        }
        if self.recv_buffer_size < HEAD_LEN {
            return Err(Error::InvalidArgument(format!(
                "recv_buffer_size cannot be less than {HEAD_LEN}"
            )));
        }
        Ok(())
    }
    /// Whether any configured address needs the IPv6 tables.
    pub fn uses_v6(&self) -> bool {
        self.listen.is_ipv6() || self.upstreams.iter().any(|addr| addr.is_ipv6())
    }
    pub fn flow_port(&self) -> u16 {
        self.flow_port.unwrap_or(self.listen.port())
    }
    pub fn set_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
    pub fn set_upstreams(mut self, upstreams: Vec<SocketAddr>) -> Self {
        self.upstreams = upstreams;
        self
    }
    pub fn set_nat_chain(mut self, nat_chain: impl Into<String>) -> Self {
        self.nat_chain = nat_chain.into();
        self
    }
    pub fn set_flow_octet(mut self, flow_octet: u8) -> Self {
        self.flow_octet = flow_octet;
        self
    }
    pub fn set_flow_port(mut self, flow_port: u16) -> Self {
        self.flow_port = Some(flow_port);
        self
    }
    pub fn set_session_idle_time(mut self, session_idle_time: Duration) -> Self {
        self.session_idle_time = session_idle_time;
        self
    }
    pub fn set_session_capacity(mut self, session_capacity: usize) -> Self {
        self.session_capacity = session_capacity;
        self
    }
    pub fn set_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }
    pub fn set_recv_buffer_size(mut self, recv_buffer_size: usize) -> Self {
        self.recv_buffer_size = recv_buffer_size;
        self
    }
    pub fn set_bind_device(mut self, bind_device: impl Into<String>) -> Self {
        self.bind_device = Some(bind_device.into());
        self
    }
}
