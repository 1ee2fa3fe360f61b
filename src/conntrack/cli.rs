use std::time::Duration;

use async_trait::async_trait;

use crate::command;
use crate::conntrack::{ConntrackController, FlowDescriptor};
use crate::error::Result;

const PROGRAM: &str = "conntrack";

/// The host connection-tracking table, driven through `conntrack(8)`.
pub struct ConntrackCli {
    use_v6: bool,
    timeout: Duration,
}

impl ConntrackCli {
    /// Fails when the `conntrack` tool is not usable.
    pub async fn open(use_v6: bool, timeout: Duration) -> Result<Self> {
        command::run(PROGRAM, &["--version".to_string()], timeout).await?;
        Ok(Self { use_v6, timeout })
    }
    fn flush_args(family: &str) -> Vec<String> {
        vec!["-F".into(), "-f".into(), family.into()]
    }
    fn delete_args(flow: &FlowDescriptor) -> Vec<String> {
        let family = if flow.is_ipv4() { "ipv4" } else { "ipv6" };
        vec![
            "-D".into(),
            "-f".into(),
            family.into(),
            "-p".into(),
            "udp".into(),
            "--orig-src".into(),
            flow.orig_src.to_string(),
            "--orig-dst".into(),
            flow.orig_dst.to_string(),
            "--sport".into(),
            flow.src_port.to_string(),
            "--dport".into(),
            flow.dst_port.to_string(),
        ]
    }
}

#[async_trait]
impl ConntrackController for ConntrackCli {
    async fn flush_all(&self) -> Result<()> {
        command::run(PROGRAM, &Self::flush_args("ipv4"), self.timeout).await?;
        if self.use_v6 {
            command::run(PROGRAM, &Self::flush_args("ipv6"), self.timeout).await?;
        }
        log::info!("conntrack table flushed");
        Ok(())
    }

    async fn delete_flow(&self, flow: &FlowDescriptor) -> Result<()> {
        command::run(PROGRAM, &Self::delete_args(flow), self.timeout).await
    }
}
