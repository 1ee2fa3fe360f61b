use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_shutdown::ShutdownManager;
use tokio::net::UdpSocket;

use crate::config::FunnelConfig;
use crate::conntrack::{ConntrackController, FlowDescriptor};
use crate::nat::NatController;
use crate::protocol::{classify, HandshakeKind};
use crate::session::{expiry_loop, Resolution, SessionCache};
use crate::socket::bind_udp;

pub use upstream::UpstreamSet;

mod upstream;

/// What [`Funnel::handle`] did with one datagram.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Shorter than the handshake header
    Rejected,
    Unknown,
    /// First phase coming from an upstream
    UpstreamOrigin,
    Broadcast {
        session_id: u32,
        sent: usize,
    },
    /// Second phase coming from something that is not an upstream
    NotUpstream,
    NoSession {
        session_id: u32,
    },
    /// Another upstream already won the session
    AlreadyResolved {
        session_id: u32,
        winner: SocketAddr,
    },
    RedirectFailed {
        session_id: u32,
    },
    ForwardFailed {
        session_id: u32,
    },
    Resolved {
        session_id: u32,
        client: SocketAddr,
        upstream: SocketAddr,
        flow_deleted: bool,
    },
}

/// The rendezvous relay.
///
/// Clients send the first handshake phase to the funnel, which fans it out
/// to every upstream. The first upstream to answer with the second phase wins
/// the client: a DNAT rule sends the client's later traffic straight to that
/// upstream, the answer is relayed back, and the client's stale tracked flow
/// is deleted so the rule applies at once.
pub struct Funnel {
    udp: UdpSocket,
    upstreams: UpstreamSet,
    sessions: SessionCache,
    nat: Arc<dyn NatController>,
    conntrack: Arc<dyn ConntrackController>,
    flow_octet: u8,
    flow_port: u16,
    recv_buffer_size: usize,
    shutdown_manager: ShutdownManager<()>,
}

impl Funnel {
    /// Reset both kernel tables and bind the external socket.
    ///
    /// Any failure here is fatal: the relay must not serve on top of stale
    /// redirects or tracked flows.
    pub async fn new(
        config: FunnelConfig,
        nat: Arc<dyn NatController>,
        conntrack: Arc<dyn ConntrackController>,
    ) -> anyhow::Result<Funnel> {
        config.check().context("invalid funnel config")?;
        nat.clear().await.context("could not clear the redirect chain")?;
        conntrack
            .flush_all()
            .await
            .context("could not flush conntrack entries")?;
        let udp = bind_udp(config.listen, config.bind_device.as_deref())?;
        let flow_port = config.flow_port();
        log::info!(
            "funnel listening on {}, upstreams {:?}",
            udp.local_addr()?,
            config.upstreams
        );
        Ok(Self {
            udp,
            upstreams: UpstreamSet::new(config.upstreams),
            sessions: SessionCache::new(config.session_idle_time, config.session_capacity),
            nat,
            conntrack,
            flow_octet: config.flow_octet,
            flow_port,
            recv_buffer_size: config.recv_buffer_size,
            shutdown_manager: ShutdownManager::new(),
        })
    }
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }
    pub fn upstreams(&self) -> &UpstreamSet {
        &self.upstreams
    }
    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown_manager
            .trigger_shutdown(())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "already shutdown"))
    }
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_manager.is_shutdown_triggered()
    }

    /// Serve until [`Funnel::shutdown`] is called, then clear the redirect
    /// chain.
    pub async fn run(&self) -> crate::error::Result<()> {
        let expiry = self
            .shutdown_manager
            .wrap_cancel(expiry_loop(self.sessions.clone()));
        tokio::spawn(async move {
            if expiry.await.is_err() {
                log::debug!("recv shutdown signal: session expiry is shutdown");
            }
        });
        log::info!("funnel initialized");
        let mut buf = vec![0u8; self.recv_buffer_size];
        loop {
            let Ok(rs) = self
                .shutdown_manager
                .wrap_cancel(self.udp.recv_from(&mut buf))
                .await
            else {
                break;
            };
            let (len, source) = match rs {
                Ok(rs) => rs,
                Err(e) => {
                    log::error!("failed to read message: {e:?}");
                    continue;
                }
            };
            let outcome = self.handle(&buf[..len], source).await;
            log::debug!("{source}: {outcome:?}");
        }
        log::info!("funnel shutting down");
        self.nat.clear().await
    }

    /// Process one datagram received from `source`.
    pub async fn handle(&self, buf: &[u8], source: SocketAddr) -> Outcome {
        let message = match classify(buf) {
            Ok(message) => message,
            Err(e) => {
                log::error!("invalid input message from {source}: {e}");
                return Outcome::Rejected;
            }
        };
        match (message.kind(), message.session_id()) {
            (HandshakeKind::First, Some(session_id)) => {
                log::info!("received first handshake message from {source}");
                self.first(message.buffer(), session_id, source).await
            }
            (HandshakeKind::Second, Some(session_id)) => {
                log::info!("received second handshake message from {source}");
                self.second(message.buffer(), session_id, source).await
            }
            _ => {
                log::error!("unmanaged message (type: {:#04x}) from {source}", buf[0]);
                Outcome::Unknown
            }
        }
    }

    async fn first(&self, buf: &[u8], session_id: u32, source: SocketAddr) -> Outcome {
        if self.upstreams.contains(&source) {
            log::warn!("skipping first handshake message, since {source} is an upstream");
            return Outcome::UpstreamOrigin;
        }
        self.sessions.put(session_id, source);
        log::info!("storing session {session_id:#x} for {source}");

        let mut sent = 0;
        for upstream in self.upstreams.iter() {
            match self.udp.send_to(buf, upstream).await {
                Ok(_) => {
                    sent += 1;
                    log::info!("message successfully sent to {upstream}");
                }
                Err(e) => log::error!("failed to send message to {upstream}: {e:?}"),
            }
        }
        Outcome::Broadcast { session_id, sent }
    }

    async fn second(&self, buf: &[u8], session_id: u32, upstream: SocketAddr) -> Outcome {
        if !self.upstreams.contains(&upstream) {
            log::warn!("skipping second handshake message, since {upstream} is not an upstream");
            return Outcome::NotUpstream;
        }
        let (client, claimed) = match self.sessions.resolve(session_id, upstream) {
            Resolution::Missing => {
                log::error!("no matching session for id {session_id:#x} from {upstream}");
                return Outcome::NoSession { session_id };
            }
            Resolution::Conflict { client, winner } => {
                log::warn!(
                    "session {session_id:#x} of {client} already resolved to {winner}, ignoring {upstream}"
                );
                return Outcome::AlreadyResolved { session_id, winner };
            }
            Resolution::Claimed(client) => (client, true),
            Resolution::Repeat(client) => (client, false),
        };
        log::info!("destination: {client}, upstream: {upstream}");

        if let Err(e) = self.nat.install_redirect(client, upstream).await {
            log::error!("failed adding redirect {client} -> {upstream}: {e}");
            if claimed {
                self.sessions.release(session_id, upstream);
            }
            return Outcome::RedirectFailed { session_id };
        }
        log::info!("redirect configured: {client} -> {upstream}");

        if let Err(e) = self.udp.send_to(buf, client).await {
            log::error!("failed to send message to {client}: {e:?}");
            return Outcome::ForwardFailed { session_id };
        }
        log::info!("message forwarded to source: {client}");

        let flow = FlowDescriptor::for_client(client, self.flow_octet, self.flow_port);
        let flow_deleted = match self.conntrack.delete_flow(&flow).await {
            Ok(()) => {
                log::info!("conntrack entry deleted: {flow}");
                true
            }
            Err(e) => {
                log::error!("failed to delete conntrack entry {flow}: {e}");
                false
            }
        };
        Outcome::Resolved {
            session_id,
            client,
            upstream,
            flow_deleted,
        }
    }
}

impl Drop for Funnel {
    fn drop(&mut self) {
        _ = self.shutdown_manager.trigger_shutdown(());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::memory::{MemoryConntrack, MemoryNat};
    use crate::nat::RedirectRule;
    use crate::session::SessionState;

    use super::*;

    struct Harness {
        funnel: Funnel,
        nat: MemoryNat,
        conntrack: MemoryConntrack,
        client: UdpSocket,
        upstreams: Vec<UdpSocket>,
    }

    impl Harness {
        async fn new() -> Harness {
            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let mut upstreams = Vec::new();
            for _ in 0..2 {
                upstreams.push(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            }
            let config = FunnelConfig::default()
                .set_listen("127.0.0.1:0".parse().unwrap())
                .set_flow_port(8080)
                .set_upstreams(upstreams.iter().map(|u| u.local_addr().unwrap()).collect());
            let nat = MemoryNat::new();
            let conntrack = MemoryConntrack::new();
            let funnel = Funnel::new(config, Arc::new(nat.clone()), Arc::new(conntrack.clone()))
                .await
                .unwrap();
            Harness {
                funnel,
                nat,
                conntrack,
                client,
                upstreams,
            }
        }
        fn client_addr(&self) -> SocketAddr {
            self.client.local_addr().unwrap()
        }
        fn upstream_addr(&self, i: usize) -> SocketAddr {
            self.upstreams[i].local_addr().unwrap()
        }
    }

    async fn recv(udp: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 2048];
        match tokio::time::timeout(Duration::from_millis(300), udp.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
            _ => None,
        }
    }

    fn first(session_id: u32, tail: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x01, 0xAA, 0xBB, 0xCC];
        buf.extend_from_slice(&session_id.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(tail);
        buf
    }

    fn second(session_id: u32, tail: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x02, 1, 2, 3, 4, 5, 6, 7];
        buf.extend_from_slice(&session_id.to_be_bytes());
        buf.extend_from_slice(tail);
        buf
    }

    #[tokio::test]
    async fn startup_resets_kernel_tables() {
        let h = Harness::new().await;
        assert_eq!(h.conntrack.flush_count(), 1);
        assert!(h.nat.rules().is_empty());
        assert!(h.funnel.sessions().is_empty());
    }

    #[tokio::test]
    async fn startup_fails_when_conntrack_flush_fails() {
        let conntrack = MemoryConntrack::new();
        conntrack.set_failing(true);
        let config = FunnelConfig::default()
            .set_listen("127.0.0.1:0".parse().unwrap())
            .set_upstreams(vec!["127.0.0.1:9".parse().unwrap()]);
        let rs = Funnel::new(config, Arc::new(MemoryNat::new()), Arc::new(conntrack)).await;
        assert!(rs.is_err());
    }

    #[tokio::test]
    async fn first_phase_is_broadcast_verbatim() {
        let h = Harness::new().await;
        let msg = first(0x2A, b"hello upstreams");
        let outcome = h.funnel.handle(&msg, h.client_addr()).await;
        assert_eq!(
            outcome,
            Outcome::Broadcast {
                session_id: 0x2A,
                sent: 2
            }
        );
        assert_eq!(h.funnel.sessions().get(0x2A), Some(h.client_addr()));
        assert_eq!(h.funnel.sessions().len(), 1);
        let funnel_addr = h.funnel.local_addr().unwrap();
        for upstream in h.upstreams.iter() {
            let (data, from) = recv(upstream).await.unwrap();
            assert_eq!(data, msg);
            assert_eq!(from, funnel_addr);
        }
        assert!(h.nat.rules().is_empty());
    }

    #[tokio::test]
    async fn first_phase_from_upstream_is_dropped() {
        let h = Harness::new().await;
        let outcome = h.funnel.handle(&first(7, &[]), h.upstream_addr(0)).await;
        assert_eq!(outcome, Outcome::UpstreamOrigin);
        assert!(h.funnel.sessions().is_empty());
        assert!(recv(&h.upstreams[1]).await.is_none());
    }

    #[tokio::test]
    async fn second_phase_from_client_is_dropped() {
        let h = Harness::new().await;
        h.funnel.handle(&first(7, &[]), h.client_addr()).await;
        let outcome = h.funnel.handle(&second(7, &[]), h.client_addr()).await;
        assert_eq!(outcome, Outcome::NotUpstream);
        assert!(h.nat.rules().is_empty());
        assert!(h.conntrack.deleted().is_empty());
        assert_eq!(
            h.funnel.sessions().entry(7).unwrap().state(),
            SessionState::Pending
        );
        assert!(recv(&h.client).await.is_none());
    }

    #[tokio::test]
    async fn second_phase_without_session_is_dropped() {
        let h = Harness::new().await;
        let outcome = h.funnel.handle(&second(99, &[]), h.upstream_addr(0)).await;
        assert_eq!(outcome, Outcome::NoSession { session_id: 99 });
        assert!(h.funnel.sessions().is_empty());
        assert!(h.nat.rules().is_empty());
        assert!(h.conntrack.deleted().is_empty());
    }

    #[tokio::test]
    async fn malformed_datagrams_have_no_effect() {
        let h = Harness::new().await;
        let short = [0x01, 0, 0, 0, 0, 0, 0, 0x2A];
        assert_eq!(h.funnel.handle(&short, h.client_addr()).await, Outcome::Rejected);
        assert_eq!(h.funnel.handle(&[], h.client_addr()).await, Outcome::Rejected);
        let unknown = [0x03; 12];
        assert_eq!(h.funnel.handle(&unknown, h.client_addr()).await, Outcome::Unknown);
        assert!(h.funnel.sessions().is_empty());
        assert!(h.nat.rules().is_empty());
        assert!(recv(&h.upstreams[0]).await.is_none());
    }

    #[tokio::test]
    async fn second_phase_resolves_session() {
        let h = Harness::new().await;
        h.funnel.handle(&first(0x2A, &[]), h.client_addr()).await;
        let reply = second(0x2A, b"from upstream 0");
        let outcome = h.funnel.handle(&reply, h.upstream_addr(0)).await;
        assert_eq!(
            outcome,
            Outcome::Resolved {
                session_id: 0x2A,
                client: h.client_addr(),
                upstream: h.upstream_addr(0),
                flow_deleted: true,
            }
        );
        assert_eq!(
            h.nat.rules(),
            vec![RedirectRule::new(h.client_addr(), h.upstream_addr(0)).unwrap()]
        );
        let (data, _) = recv(&h.client).await.unwrap();
        assert_eq!(data, reply);
        assert_eq!(
            h.conntrack.deleted(),
            vec![FlowDescriptor::for_client(h.client_addr(), 4, 8080)]
        );
        assert_eq!(
            h.funnel.sessions().entry(0x2A).unwrap().state(),
            SessionState::Resolved(h.upstream_addr(0))
        );
    }

    #[tokio::test]
    async fn repeated_answer_is_idempotent() {
        let h = Harness::new().await;
        h.funnel.handle(&first(5, &[]), h.client_addr()).await;
        let reply = second(5, b"again");
        for _ in 0..2 {
            let outcome = h.funnel.handle(&reply, h.upstream_addr(0)).await;
            assert!(matches!(outcome, Outcome::Resolved { .. }));
            assert_eq!(recv(&h.client).await.unwrap().0, reply);
        }
        assert_eq!(h.nat.rules().len(), 1);
    }

    #[tokio::test]
    async fn late_upstream_is_ignored() {
        let h = Harness::new().await;
        h.funnel.handle(&first(5, &[]), h.client_addr()).await;
        h.funnel.handle(&second(5, b"u0"), h.upstream_addr(0)).await;
        assert!(recv(&h.client).await.is_some());
        let outcome = h.funnel.handle(&second(5, b"u1"), h.upstream_addr(1)).await;
        assert_eq!(
            outcome,
            Outcome::AlreadyResolved {
                session_id: 5,
                winner: h.upstream_addr(0)
            }
        );
        assert_eq!(h.nat.rules().len(), 1);
        assert_eq!(h.nat.rules()[0].upstream, h.upstream_addr(0));
        assert!(recv(&h.client).await.is_none());
    }

    #[tokio::test]
    async fn nat_failure_aborts_and_releases() {
        let h = Harness::new().await;
        h.funnel.handle(&first(8, &[]), h.client_addr()).await;
        h.nat.set_failing(true);
        let outcome = h.funnel.handle(&second(8, &[]), h.upstream_addr(0)).await;
        assert_eq!(outcome, Outcome::RedirectFailed { session_id: 8 });
        assert!(recv(&h.client).await.is_none());
        assert!(h.conntrack.deleted().is_empty());
        assert_eq!(
            h.funnel.sessions().entry(8).unwrap().state(),
            SessionState::Pending
        );

        // another upstream can still win the session
        h.nat.set_failing(false);
        let outcome = h.funnel.handle(&second(8, &[]), h.upstream_addr(1)).await;
        assert!(matches!(outcome, Outcome::Resolved { upstream, .. } if upstream == h.upstream_addr(1)));
    }

    #[tokio::test]
    async fn conntrack_failure_is_not_fatal() {
        let h = Harness::new().await;
        h.funnel.handle(&first(9, &[]), h.client_addr()).await;
        h.conntrack.set_failing(true);
        let outcome = h.funnel.handle(&second(9, &[]), h.upstream_addr(0)).await;
        assert!(matches!(
            outcome,
            Outcome::Resolved {
                flow_deleted: false,
                ..
            }
        ));
        assert_eq!(h.nat.rules().len(), 1);
        assert!(recv(&h.client).await.is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_clears_rules() {
        let h = Harness::new().await;
        h.funnel.handle(&first(1, &[]), h.client_addr()).await;
        h.funnel.handle(&second(1, &[]), h.upstream_addr(0)).await;
        assert_eq!(h.nat.rules().len(), 1);
        let funnel = Arc::new(h.funnel);
        let task = tokio::spawn({
            let funnel = funnel.clone();
            async move { funnel.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        funnel.shutdown().unwrap();
        assert!(funnel.shutdown().is_err());
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(h.nat.rules().is_empty());
    }

    /// A funnel whose first upstream is the limited broadcast address, which
    /// an ordinary socket cannot send to.
    async fn with_unreachable_upstream() -> (Funnel, UdpSocket, MemoryNat, MemoryConntrack) {
        let reachable = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = FunnelConfig::default()
            .set_listen("127.0.0.1:0".parse().unwrap())
            .set_upstreams(vec![
                "255.255.255.255:9".parse().unwrap(),
                reachable.local_addr().unwrap(),
            ]);
        let nat = MemoryNat::new();
        let conntrack = MemoryConntrack::new();
        let funnel = Funnel::new(config, Arc::new(nat.clone()), Arc::new(conntrack.clone()))
            .await
            .unwrap();
        (funnel, reachable, nat, conntrack)
    }

    #[tokio::test]
    async fn failed_upstream_send_does_not_stop_broadcast() {
        let (funnel, reachable, ..) = with_unreachable_upstream().await;
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let msg = first(0x11, b"fan out");
        let outcome = funnel.handle(&msg, client).await;
        assert_eq!(
            outcome,
            Outcome::Broadcast {
                session_id: 0x11,
                sent: 1
            }
        );
        assert_eq!(recv(&reachable).await.unwrap().0, msg);
        assert_eq!(funnel.sessions().get(0x11), Some(client));
    }

    #[tokio::test]
    async fn forward_failure_keeps_redirect_and_resolution() {
        let (funnel, reachable, nat, conntrack) = with_unreachable_upstream().await;
        let client: SocketAddr = "255.255.255.255:5000".parse().unwrap();
        let upstream = reachable.local_addr().unwrap();
        funnel.handle(&first(0x12, &[]), client).await;
        let outcome = funnel.handle(&second(0x12, b"answer"), upstream).await;
        assert_eq!(outcome, Outcome::ForwardFailed { session_id: 0x12 });
        assert_eq!(nat.rules(), vec![RedirectRule::new(client, upstream).unwrap()]);
        assert!(conntrack.deleted().is_empty());
        assert_eq!(
            funnel.sessions().entry(0x12).unwrap().state(),
            SessionState::Resolved(upstream)
        );
    }
}
