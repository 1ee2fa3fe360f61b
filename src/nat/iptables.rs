use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::command;
use crate::error::{Error, Result};
use crate::nat::{NatController, RedirectRule};

const TABLE: &str = "nat";
const BUILTIN_CHAIN: &str = "PREROUTING";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn program(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// The relay's redirect chain in the kernel `nat` table, driven through
/// `iptables`/`ip6tables`.
///
/// Opening the handle creates the chain if needed, hooks it into
/// `PREROUTING` and flushes it. Redirects left in the chain are flushed by
/// [`NatController::clear`] or, failing that, when the handle is dropped.
pub struct IptablesNat {
    chain: String,
    families: Vec<Family>,
    timeout: Duration,
    client_locks: DashMap<SocketAddr, Arc<tokio::sync::Mutex<()>>>,
    dirty: AtomicBool,
}

impl IptablesNat {
    pub async fn open(chain: impl Into<String>, use_v6: bool, timeout: Duration) -> Result<Self> {
        let chain = chain.into();
        if chain.is_empty() {
            return Err(Error::InvalidArgument("chain name cannot be empty".into()));
        }
        let mut families = vec![Family::V4];
        if use_v6 {
            families.push(Family::V6);
        }
        let nat = Self {
            chain,
            families,
            timeout,
            client_locks: DashMap::new(),
            dirty: AtomicBool::new(false),
        };
        for family in nat.families.iter() {
            nat.setup(*family).await?;
        }
        log::info!("nat chain {} ready", nat.chain);
        Ok(nat)
    }
    pub fn chain(&self) -> &str {
        &self.chain
    }
    async fn setup(&self, family: Family) -> Result<()> {
        let program = family.program();
        command::run(program, &["--version".to_string()], self.timeout).await?;
        if self.chain != BUILTIN_CHAIN {
            if !command::check(program, &self.list_args(), self.timeout).await? {
                command::run(program, &self.new_chain_args(), self.timeout).await?;
            }
            if !command::check(program, &self.jump_args("-C"), self.timeout).await? {
                command::run(program, &self.jump_args("-I"), self.timeout).await?;
            }
        }
        command::run(program, &self.flush_args(), self.timeout).await
    }
    fn family_of(&self, rule: &RedirectRule) -> Result<Family> {
        let family = if rule.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        };
        if !self.families.contains(&family) {
            return Err(Error::InvalidArgument(format!(
                "{} is not managed for {rule}",
                family.program()
            )));
        }
        Ok(family)
    }
    async fn append_unique(&self, program: &'static str, rule: &RedirectRule) -> Result<()> {
        if command::check(program, &self.rule_args("-C", rule), self.timeout).await? {
            log::debug!("redirect already present: {rule}");
            return Ok(());
        }
        command::run(program, &self.rule_args("-A", rule), self.timeout).await?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }
    /// `-w` waits for the xtables lock; the command timeout bounds the wait.
    fn table_args(&self, op: &str, chain: &str) -> Vec<String> {
        vec![
            "-w".into(),
            "-t".into(),
            TABLE.into(),
            op.into(),
            chain.into(),
        ]
    }
    fn list_args(&self) -> Vec<String> {
        let mut args = self.table_args("-L", &self.chain);
        args.insert(3, "-n".into());
        args
    }
    fn new_chain_args(&self) -> Vec<String> {
        self.table_args("-N", &self.chain)
    }
    fn jump_args(&self, op: &str) -> Vec<String> {
        let mut args = self.table_args(op, BUILTIN_CHAIN);
        if op == "-I" {
            args.push("1".into());
        }
        args.push("-j".into());
        args.push(self.chain.clone());
        args
    }
    fn flush_args(&self) -> Vec<String> {
        self.table_args("-F", &self.chain)
    }
    fn rule_args(&self, op: &str, rule: &RedirectRule) -> Vec<String> {
        let mut args = self.table_args(op, &self.chain);
        args.extend(rule.rule_spec());
        args
    }
    fn flush_blocking(&self) {
        for family in self.families.iter() {
            match std::process::Command::new(family.program())
                .args(self.flush_args())
                .output()
            {
                Ok(output) if output.status.success() => {}
                Ok(output) => log::warn!(
                    "{} flush of {} failed: {}",
                    family.program(),
                    self.chain,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => log::warn!("{} flush of {} failed: {e}", family.program(), self.chain),
            }
        }
    }
}

#[async_trait]
impl NatController for IptablesNat {
    async fn install_redirect(&self, client: SocketAddr, upstream: SocketAddr) -> Result<()> {
        let rule = RedirectRule::new(client, upstream)?;
        let program = self.family_of(&rule)?.program();
        let lock = self.client_locks.entry(client).or_default().clone();
        let rs = {
            let _guard = lock.lock().await;
            self.append_unique(program, &rule).await
        };
        drop(lock);
        self.client_locks
            .remove_if(&client, |_, lock| Arc::strong_count(lock) == 1);
        rs
    }

    async fn clear(&self) -> Result<()> {
        for family in self.families.iter() {
            command::run(family.program(), &self.flush_args(), self.timeout).await?;
        }
        self.dirty.store(false, Ordering::Release);
        log::info!("nat chain {} cleared", self.chain);
        Ok(())
    }
}

impl Drop for IptablesNat {
    fn drop(&mut self) {
        if !self.dirty.load(Ordering::Acquire) {
            return;
        }
        // `clear` was skipped, so flush synchronously. Off the reactor when
        // the runtime allows it.
        log::warn!("nat chain {} dropped with redirects, flushing", self.chain);
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.flush_blocking())
            }
            _ => self.flush_blocking(),
        }
    }
}
