//! In-process stand-ins for the kernel tables.
//!
//! Used by `funnel --dry-run` to exercise the handshake without root, and by
//! the tests to observe what the relay asked the kernel to do.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::conntrack::{ConntrackController, FlowDescriptor};
use crate::error::{Error, Result};
use crate::nat::{NatController, RedirectRule};

fn injected(what: &str) -> Error {
    Error::Io(std::io::Error::other(format!("{what} failure injected")))
}

#[derive(Clone, Default)]
pub struct MemoryNat {
    rules: Arc<Mutex<Vec<RedirectRule>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryNat {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn rules(&self) -> Vec<RedirectRule> {
        self.rules.lock().clone()
    }
    /// Make every following mutation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl NatController for MemoryNat {
    async fn install_redirect(&self, client: SocketAddr, upstream: SocketAddr) -> Result<()> {
        let rule = RedirectRule::new(client, upstream)?;
        if self.failing.load(Ordering::Relaxed) {
            return Err(injected("nat"));
        }
        let mut rules = self.rules.lock();
        if !rules.contains(&rule) {
            log::info!("[dry-run] redirect {rule}");
            rules.push(rule);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(injected("nat"));
        }
        self.rules.lock().clear();
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryConntrack {
    deleted: Arc<Mutex<Vec<FlowDescriptor>>>,
    flushes: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MemoryConntrack {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn deleted(&self) -> Vec<FlowDescriptor> {
        self.deleted.lock().clone()
    }
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl ConntrackController for MemoryConntrack {
    async fn flush_all(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(injected("conntrack"));
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete_flow(&self, flow: &FlowDescriptor) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(injected("conntrack"));
        }
        log::info!("[dry-run] delete flow {flow}");
        self.deleted.lock().push(*flow);
        Ok(())
    }
}
