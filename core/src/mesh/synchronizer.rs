//! Completion registry
//!
//! Proxy operations are fire-and-estimate: the caller registers interest in
//! a completion key and awaits it, the mesh base completes the key when the
//! partner's answer arrives. A second caller registering the same key joins
//! the entry that is already in flight and gets the same result.

use crate::identifier::{MeshBaseId, MeshObjectId};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Why an awaited operation did not complete successfully
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Timed out")]
    Timeout,
    #[error("Object not found: {0}")]
    NotFound(MeshObjectId),
    #[error("Denied: {0}")]
    Denied(String),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Proxy to {partner} failed: {reason}")]
    ProxyFailed { partner: MeshBaseId, reason: String },
    #[error("Mesh base is dead")]
    MeshBaseDead,
}

/// What a waiter is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingKey {
    /// First-time replica of an object
    Replica(MeshObjectId),
    Lock(MeshObjectId),
    Home(MeshObjectId),
    /// Fresh state after a resynchronize or freshen request
    Resync(MeshObjectId),
}

impl PendingKey {
    pub fn object(&self) -> &MeshObjectId {
        match self {
            PendingKey::Replica(id)
            | PendingKey::Lock(id)
            | PendingKey::Home(id)
            | PendingKey::Resync(id) => id,
        }
    }
}

pub type Completion = Result<(), AccessError>;

struct PendingEntry {
    partner: MeshBaseId,
    waiters: Vec<oneshot::Sender<Completion>>,
}

#[derive(Default)]
pub struct Synchronizer {
    entries: HashMap<PendingKey, PendingEntry>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Returns the receiver and whether this is the first
    /// waiter for the key (the caller must then start the operation).
    pub fn register(
        &mut self,
        key: PendingKey,
        partner: &MeshBaseId,
    ) -> (oneshot::Receiver<Completion>, bool) {
        let (tx, rx) = oneshot::channel();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                // waiters that gave up no longer hold the request open
                entry.waiters.retain(|waiter| !waiter.is_closed());
                let first = entry.waiters.is_empty();
                if first {
                    entry.partner = partner.clone();
                } else {
                    debug!("Joining in-flight request {:?}", key);
                }
                entry.waiters.push(tx);
                (rx, first)
            }
            None => {
                self.entries.insert(
                    key,
                    PendingEntry {
                        partner: partner.clone(),
                        waiters: vec![tx],
                    },
                );
                (rx, true)
            }
        }
    }

    /// Complete every waiter of `key`; returns how many there were
    pub fn complete(&mut self, key: &PendingKey, result: Completion) -> usize {
        match self.entries.remove(key) {
            Some(entry) => {
                let count = entry.waiters.len();
                for waiter in entry.waiters {
                    let _ = waiter.send(result.clone());
                }
                count
            }
            None => 0,
        }
    }

    /// Fail everything waiting on `partner`
    pub fn fail_partner(&mut self, partner: &MeshBaseId, error: AccessError) -> usize {
        let keys: Vec<PendingKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| &entry.partner == partner)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter()
            .map(|key| self.complete(key, Err(error.clone())))
            .sum()
    }

    pub fn fail_all(&mut self, error: AccessError) -> usize {
        let keys: Vec<PendingKey> = self.entries.keys().cloned().collect();
        keys.iter()
            .map(|key| self.complete(key, Err(error.clone())))
            .sum()
    }

    pub fn is_pending(&self, key: &PendingKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}
