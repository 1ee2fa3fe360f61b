use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

use udp_funnel::config::FunnelConfig;
use udp_funnel::conntrack::{ConntrackCli, ConntrackController};
use udp_funnel::funnel::Funnel;
use udp_funnel::memory::{MemoryConntrack, MemoryNat};
use udp_funnel::nat::{IptablesNat, NatController};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON config file, flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// External-facing listen address.
    /// example: --listen 0.0.0.0:8080
    #[arg(short, long)]
    listen: Option<SocketAddr>,
    /// Upstream address, repeat for each upstream.
    /// example: --upstream 169.254.4.1:8080 --upstream 169.254.5.1:8080
    #[arg(short, long)]
    upstream: Option<Vec<SocketAddr>>,
    /// Chain in the nat table holding the redirects
    #[arg(long)]
    nat_chain: Option<String>,
    /// Last octet of the stale flow's source address
    #[arg(long)]
    flow_octet: Option<u8>,
    /// Port on both legs of the stale flow
    #[arg(long)]
    flow_port: Option<u16>,
    /// Seconds before an unanswered or resolved session is forgotten
    #[arg(long)]
    session_idle_secs: Option<u64>,
    /// Bind the socket to this network interface
    #[arg(short, long)]
    device: Option<String>,
    /// Keep redirects and conntrack deletions in memory instead of the kernel
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(FunnelConfig, bool)> {
        let mut config = match self.config.as_ref() {
            Some(path) => FunnelConfig::from_json_file(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => FunnelConfig::default(),
        };
        if let Some(listen) = self.listen {
            config = config.set_listen(listen);
        }
        if let Some(upstreams) = self.upstream {
            config = config.set_upstreams(upstreams);
        }
        if let Some(nat_chain) = self.nat_chain {
            config = config.set_nat_chain(nat_chain);
        }
        if let Some(flow_octet) = self.flow_octet {
            config = config.set_flow_octet(flow_octet);
        }
        if let Some(flow_port) = self.flow_port {
            config = config.set_flow_port(flow_port);
        }
        if let Some(secs) = self.session_idle_secs {
            config = config.set_session_idle_time(Duration::from_secs(secs));
        }
        if let Some(device) = self.device {
            config = config.set_bind_device(device);
        }
        config.check()?;
        Ok((config, self.dry_run))
    }
}

/// Ctrl-C, plus SIGTERM where it exists, which is how containers are stopped.
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl ShutdownSignals {
    fn register() -> io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            interrupt: signal(SignalKind::interrupt())?,
            #[cfg(unix)]
            terminate: signal(SignalKind::terminate())?,
        })
    }
    #[cfg(unix)]
    async fn recv(&mut self) -> io::Result<&'static str> {
        tokio::select! {
            _ = self.interrupt.recv() => Ok("ctrl-c"),
            _ = self.terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    async fn recv(&mut self) -> io::Result<&'static str> {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let (config, dry_run) = Args::parse().into_config()?;

    let (nat, conntrack): (Arc<dyn NatController>, Arc<dyn ConntrackController>) = if dry_run {
        log::warn!("dry run: kernel tables are left untouched");
        (Arc::new(MemoryNat::new()), Arc::new(MemoryConntrack::new()))
    } else {
        let v6 = config.uses_v6();
        let nat = IptablesNat::open(config.nat_chain.clone(), v6, config.command_timeout)
            .await
            .context("failed to initialize the nat table")?;
        let conntrack = ConntrackCli::open(v6, config.command_timeout)
            .await
            .context("could not open conntrack")?;
        (Arc::new(nat), Arc::new(conntrack))
    };

    let funnel = Arc::new(Funnel::new(config, nat, conntrack).await?);
    let mut signals = ShutdownSignals::register().context("could not install signal handlers")?;
    let signal = funnel.clone();
    tokio::spawn(async move {
        match signals.recv().await {
            Ok(name) => log::info!("recv {name}"),
            Err(e) => {
                log::error!("signal handler: {e:?}");
                return;
            }
        }
        _ = signal.shutdown();
    });
    funnel.run().await?;
    log::info!("exit!");
    Ok(())
}
