use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

pub use expiry::expiry_loop;

mod expiry;

/// A full cache evicts this share of its capacity at once, so a flood of new
/// ids pays for one scan per batch rather than one per insert.
const EVICTION_BATCH_DIVISOR: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The first phase was seen and broadcast, no upstream has answered yet
    Pending,
    /// An upstream answered and the client was redirected to it
    Resolved(SocketAddr),
}

#[derive(Copy, Clone, Debug)]
pub struct SessionEntry {
    client: SocketAddr,
    state: SessionState,
    touched: Instant,
}

impl SessionEntry {
    fn new(client: SocketAddr) -> Self {
        Self {
            client,
            state: SessionState::Pending,
            touched: Instant::now(),
        }
    }
    pub fn client(&self) -> SocketAddr {
        self.client
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn touched(&self) -> Instant {
        self.touched
    }
}

/// Result of matching a second-phase message against the cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Missing,
    /// The session was pending and now belongs to the answering upstream.
    Claimed(SocketAddr),
    /// The same upstream answered again for a session it already won.
    Repeat(SocketAddr),
    /// A different upstream already won the session.
    Conflict {
        client: SocketAddr,
        winner: SocketAddr,
    },
}

/// Session id to client address mapping.
///
/// Every operation touches a single key under the map's shard lock, so
/// concurrent writers resolve to last-writer-wins and readers never see a
/// partially written entry. Entries expire after `idle_time` and the number of
/// live sessions is capped at `capacity`; inserts are admitted one at a time
/// so the cap holds under concurrent writers.
#[derive(Clone)]
pub struct SessionCache {
    sessions: Arc<DashMap<u32, SessionEntry>>,
    admission: Arc<Mutex<()>>,
    idle_time: Duration,
    capacity: usize,
}

impl SessionCache {
    pub fn new(idle_time: Duration, capacity: usize) -> SessionCache {
        Self {
            sessions: Arc::new(DashMap::with_capacity(capacity.min(1024))),
            admission: Arc::new(Mutex::new(())),
            idle_time,
            capacity,
        }
    }
    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
    /// Record the client of a session, replacing whatever was stored for `id`.
    pub fn put(&self, id: u32, client: SocketAddr) {
        let _admission = self.admission.lock();
        if !self.sessions.contains_key(&id) && self.sessions.len() >= self.capacity {
            self.evict_oldest_batch();
        }
        if let Some(old) = self.sessions.insert(id, SessionEntry::new(client)) {
            if old.client != client {
                log::warn!(
                    "session {id:#x} overwritten: {} -> {client}",
                    old.client
                );
            }
        }
    }
    pub fn get(&self, id: u32) -> Option<SocketAddr> {
        self.sessions.get(&id).map(|entry| entry.client)
    }
    pub fn entry(&self, id: u32) -> Option<SessionEntry> {
        self.sessions.get(&id).map(|entry| *entry)
    }
    /// Claim a session for `upstream`. The first upstream to answer wins it.
    pub fn resolve(&self, id: u32, upstream: SocketAddr) -> Resolution {
        match self.sessions.entry(id) {
            Entry::Vacant(_) => Resolution::Missing,
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                match entry.state {
                    SessionState::Pending => {
                        entry.state = SessionState::Resolved(upstream);
                        entry.touched = Instant::now();
                        Resolution::Claimed(entry.client)
                    }
                    SessionState::Resolved(winner) if winner == upstream => {
                        entry.touched = Instant::now();
                        Resolution::Repeat(entry.client)
                    }
                    SessionState::Resolved(winner) => Resolution::Conflict {
                        client: entry.client,
                        winner,
                    },
                }
            }
        }
    }
    /// Hand a session claimed by `upstream` back to the pending state.
    pub fn release(&self, id: u32, upstream: SocketAddr) -> bool {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            if entry.state == SessionState::Resolved(upstream) {
                entry.state = SessionState::Pending;
                return true;
            }
        }
        false
    }
    pub fn remove(&self, id: u32) -> Option<SessionEntry> {
        self.sessions.remove(&id).map(|(_, entry)| entry)
    }
    /// The least recently touched session
    pub fn oldest(&self) -> Option<(u32, Instant)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.touched))
            .min_by_key(|(_, touched)| *touched)
    }
    /// Drop every session idle for longer than `idle_time`.
    pub fn evict_expired(&self) -> usize {
        let idle_time = self.idle_time;
        let mut count = 0;
        self.sessions.retain(|_, entry| {
            let keep = entry.touched.elapsed() <= idle_time;
            if !keep {
                count += 1;
            }
            keep
        });
        count
    }
    fn evict_oldest_batch(&self) {
        let batch = (self.capacity / EVICTION_BATCH_DIVISOR).max(1);
        let mut ages: Vec<(Instant, u32)> = self
            .sessions
            .iter()
            .map(|entry| (entry.touched, *entry.key()))
            .collect();
        if ages.len() > batch {
            ages.select_nth_unstable(batch - 1);
            ages.truncate(batch);
        }
        let mut count = 0;
        for (touched, id) in ages {
            if self
                .sessions
                .remove_if(&id, |_, entry| entry.touched == touched)
                .is_some()
            {
                count += 1;
            }
        }
        log::debug!("session cache full, evicted {count} oldest sessions");
    }
}
