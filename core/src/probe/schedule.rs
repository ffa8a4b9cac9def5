//! Probe update specification
//!
//! Per-shadow schedule metadata. It is persisted independently of the
//! shadow mesh base so that scheduling survives disposal and restarts.

use super::coherence::{CoherenceSpecification, RunOutcome};
use crate::identifier::MeshBaseId;
use crate::store::{get_record, put_record, scan_records, StorageBackend, StoreError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SCHEDULE_PREFIX: &str = "probe_schedule_";

/// Scheduling state of one shadow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeUpdateSpecification {
    pub shadow: MeshBaseId,
    /// Coherence in force; adaptive state evolves with every run
    pub coherence: CoherenceSpecification,
    /// Milliseconds since the Unix epoch; `None` = no further run
    pub next_probe_run: Option<u64>,
    pub last_probe_run: Option<u64>,
    /// Completed runs, successful or not
    pub probe_run_counter: u64,
    pub last_run_successful: bool,
    pub last_run_used_writable_probe: bool,
    pub last_probe_name: Option<String>,
    /// Wait for a running update instead of skipping the request
    pub wait_for_ongoing_resynchronization: bool,
    pub last_error: Option<String>,
    /// blake3 digest (hex) of the last successful probe output
    pub content_digest: Option<String>,
    pub stopped: bool,
}

impl ProbeUpdateSpecification {
    /// A schedule whose first run is due at `now`
    pub fn new(shadow: MeshBaseId, coherence: CoherenceSpecification, now: u64) -> Self {
        Self {
            shadow,
            coherence,
            next_probe_run: Some(now),
            last_probe_run: None,
            probe_run_counter: 0,
            last_run_successful: false,
            last_run_used_writable_probe: false,
            last_probe_name: None,
            wait_for_ongoing_resynchronization: false,
            last_error: None,
            content_digest: None,
            stopped: false,
        }
    }

    pub fn storage_key(shadow: &MeshBaseId) -> String {
        format!("{}{}", SCHEDULE_PREFIX, shadow.storage_key())
    }

    pub fn performed_successful_run_no_change(&mut self, started: u64, probe: &str, writable: bool) {
        self.last_run_used_writable_probe = writable;
        self.last_error = None;
        self.record_run(started, probe, RunOutcome::SuccessNoChange);
    }

    pub fn performed_successful_run_with_change(
        &mut self,
        started: u64,
        probe: &str,
        writable: bool,
        digest: String,
    ) {
        self.last_run_used_writable_probe = writable;
        self.last_error = None;
        self.content_digest = Some(digest);
        self.record_run(started, probe, RunOutcome::SuccessWithChange);
    }

    pub fn performed_unsuccessful_run(&mut self, started: u64, probe: &str, error: String) {
        self.last_error = Some(error);
        self.record_run(started, probe, RunOutcome::Failed);
    }

    fn record_run(&mut self, started: u64, probe: &str, outcome: RunOutcome) {
        self.probe_run_counter += 1;
        self.last_probe_run = Some(started);
        self.last_run_successful = outcome != RunOutcome::Failed;
        self.last_probe_name = Some(probe.to_string());
        let delay = self.coherence.advance(outcome);
        self.next_probe_run = if self.stopped {
            None
        } else {
            delay.map(|d| started + d.as_millis() as u64)
        };
    }

    /// Replace the coherence in force; the next run moves accordingly
    pub fn adopt_coherence(&mut self, coherence: CoherenceSpecification, now: u64) {
        self.coherence = coherence;
        if self.stopped {
            return;
        }
        self.next_probe_run = match self.last_probe_run {
            Some(last) => self
                .coherence
                .current_delay()
                .map(|d| last + d.as_millis() as u64),
            None => Some(now),
        };
    }

    /// No more scheduled runs until explicitly requested
    pub fn stop_updating(&mut self) {
        self.stopped = true;
        self.next_probe_run = None;
        self.coherence.reset();
    }

    /// Time left until the next run; zero if past due, `None` if none is scheduled
    pub fn delay_until_next_run(&self, now: u64) -> Option<Duration> {
        if self.stopped {
            return None;
        }
        self.next_probe_run
            .map(|next| Duration::from_millis(next.saturating_sub(now)))
    }

    pub fn save(&self, store: &dyn StorageBackend) -> Result<(), StoreError> {
        put_record(store, &Self::storage_key(&self.shadow), self)
    }

    pub fn load(store: &dyn StorageBackend, shadow: &MeshBaseId) -> Result<Option<Self>, StoreError> {
        get_record(store, &Self::storage_key(shadow))
    }

    pub fn load_all(store: &dyn StorageBackend) -> Result<Vec<Self>, StoreError> {
        Ok(scan_records(store, SCHEDULE_PREFIX)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    pub fn delete(store: &dyn StorageBackend, shadow: &MeshBaseId) -> Result<(), StoreError> {
        store.remove(Self::storage_key(shadow).as_bytes())
    }
}
