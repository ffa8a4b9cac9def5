//! A proxy: the local representative of one partner mesh base
//!
//! Requests and incoming messages are turned into instructions by the
//! proxy's policy. Local effects are applied through the [`ReplicaHost`]
//! right away; outgoing operations accumulate in one batch that is flushed
//! into a single protocol message after a short delay, so everything decided
//! within one processing cycle travels together.

use super::event::{InitiateResynchronizeFailedEvent, ProxyListeners, SendFailedEvent};
use super::externalized::ExternalizedProxy;
use super::instructions::{LocalEffect, ProxyProcessingInstructions};
use super::policy::{PolicyContext, ProxyPolicy};
use crate::comm::{EndpointEvent, EndpointState, MessageEndpoint, TimerEvent, TimerKind, TransportError};
use crate::config::ProxyConfig;
use crate::identifier::{AccessPath, MeshBaseId, MeshObjectId};
use crate::mesh::object::now_millis;
use crate::mesh::synchronizer::{AccessError, PendingKey};
use crate::mesh::transaction::{CommittedTransaction, ReplicaMap};
use crate::message::{Operation, ProtocolMessage};
use crate::probe::coherence::CoherenceSpecification;
use crate::scheduler::{Scheduler, TaskHandle};
use parking_lot::RwLockReadGuard;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The mesh base side a proxy acts upon
pub trait ReplicaHost: Send {
    fn replicas(&self) -> RwLockReadGuard<'_, ReplicaMap>;

    /// Whether the mesh base can write through to its data source
    fn writable(&self) -> bool;

    fn is_pending(&self, key: &PendingKey) -> bool;

    fn apply(&mut self, partner: &MeshBaseId, effect: LocalEffect);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyState {
    Active,
    /// Graceful death in progress
    Dying,
    Dead,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyState::Active => write!(f, "active"),
            ProxyState::Dying => write!(f, "dying"),
            ProxyState::Dead => write!(f, "dead"),
        }
    }
}

/// What a proxy needs besides its endpoint
#[derive(Clone)]
pub struct ProxyDeps {
    pub scheduler: Scheduler,
    pub timers: mpsc::UnboundedSender<TimerEvent>,
    pub config: ProxyConfig,
    /// How long outgoing operations wait for company before being sent
    pub flush_delay: Duration,
}

pub struct Proxy {
    own: MeshBaseId,
    partner: MeshBaseId,
    time_created: u64,
    time_updated: u64,
    time_read: u64,
    time_expires: Option<u64>,
    coherence: Option<CoherenceSpecification>,
    policy: Arc<dyn ProxyPolicy>,
    endpoint: MessageEndpoint,
    listeners: Arc<ProxyListeners>,
    outgoing: Option<Vec<Operation>>,
    flush_timer: Option<TaskHandle>,
    flush_generation: u64,
    state: ProxyState,
    deps: ProxyDeps,
}

impl Proxy {
    pub fn new(
        own: MeshBaseId,
        partner: MeshBaseId,
        policy: Arc<dyn ProxyPolicy>,
        endpoint: MessageEndpoint,
        listeners: Arc<ProxyListeners>,
        deps: ProxyDeps,
    ) -> Self {
        let now = now_millis();
        Self {
            own,
            partner,
            time_created: now,
            time_updated: now,
            time_read: now,
            time_expires: None,
            coherence: None,
            policy,
            endpoint,
            listeners,
            outgoing: None,
            flush_timer: None,
            flush_generation: 0,
            state: ProxyState::Active,
            deps,
        }
    }

    /// Recreate a proxy from its persisted form
    pub fn restore(
        record: ExternalizedProxy,
        policy: Arc<dyn ProxyPolicy>,
        endpoint: MessageEndpoint,
        listeners: Arc<ProxyListeners>,
        deps: ProxyDeps,
    ) -> Self {
        let mut proxy = Self::new(record.own, record.partner, policy, endpoint, listeners, deps);
        proxy.time_created = record.time_created;
        proxy.time_updated = record.time_updated;
        proxy.time_read = record.time_read;
        proxy.time_expires = record.time_expires;
        proxy.coherence = record.coherence;
        proxy
    }

    pub fn externalize(&self) -> ExternalizedProxy {
        ExternalizedProxy {
            own: self.own.clone(),
            partner: self.partner.clone(),
            policy: self.policy.name().to_string(),
            time_created: self.time_created,
            time_updated: self.time_updated,
            time_read: self.time_read,
            time_expires: self.time_expires,
            coherence: self.coherence.clone(),
            endpoint: self.endpoint.externalize(),
        }
    }

    pub fn own(&self) -> &MeshBaseId {
        &self.own
    }

    pub fn partner(&self) -> &MeshBaseId {
        &self.partner
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn endpoint(&self) -> &MessageEndpoint {
        &self.endpoint
    }

    /// Freshness this side asked the partner for
    pub fn coherence(&self) -> Option<&CoherenceSpecification> {
        self.coherence.as_ref()
    }

    pub fn time_created(&self) -> u64 {
        self.time_created
    }

    pub fn time_updated(&self) -> u64 {
        self.time_updated
    }

    pub fn time_read(&self) -> u64 {
        self.time_read
    }

    pub fn time_expires(&self) -> Option<u64> {
        self.time_expires
    }

    pub fn set_time_expires(&mut self, expires: Option<u64>) {
        self.time_expires = expires;
    }

    /// Operations decided but not yet handed to the endpoint
    pub fn outgoing_len(&self) -> usize {
        self.outgoing.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub async fn start(&mut self) {
        if self.state == ProxyState::Active {
            self.endpoint.start_communicating().await;
        }
    }

    /// The transport gave up on frames already sent to the partner
    pub fn transport_rejected(&mut self, error: TransportError) {
        self.endpoint.reject(error);
    }

    pub fn stop(&mut self) {
        self.cancel_flush_timer();
        self.endpoint.stop_communicating();
    }

    // ------------------------------------------------------------------
    // Requests issued by the local mesh base. Each returns how long the
    // caller should expect to wait for the answer.
    // ------------------------------------------------------------------

    pub fn obtain_replicas(
        &mut self,
        paths: &[AccessPath],
        coherence: Option<&CoherenceSpecification>,
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        if let Some(coherence) = coherence {
            self.coherence = Some(coherence.clone());
        }
        self.request(host, desired, |policy, ctx| {
            policy.obtain_replicas(ctx, paths, coherence)
        })
    }

    pub fn try_obtain_locks(
        &mut self,
        objects: &[MeshObjectId],
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        self.request(host, desired, |policy, ctx| policy.try_obtain_locks(ctx, objects))
    }

    pub fn try_push_locks(
        &mut self,
        objects: &[MeshObjectId],
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        self.request(host, desired, |policy, ctx| policy.try_push_locks(ctx, objects))
    }

    pub fn try_obtain_home_replicas(
        &mut self,
        objects: &[MeshObjectId],
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        self.request(host, desired, |policy, ctx| {
            policy.try_obtain_home_replicas(ctx, objects)
        })
    }

    pub fn try_push_home_replicas(
        &mut self,
        objects: &[MeshObjectId],
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        self.request(host, desired, |policy, ctx| {
            policy.try_push_home_replicas(ctx, objects)
        })
    }

    pub fn force_obtain_locks(
        &mut self,
        objects: &[MeshObjectId],
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        self.request(host, desired, |policy, ctx| policy.force_obtain_locks(ctx, objects))
    }

    pub fn try_resynchronize_replicas(
        &mut self,
        objects: &[MeshObjectId],
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        self.request(host, desired, |policy, ctx| {
            policy.try_resynchronize_replicas(ctx, objects)
        })
    }

    pub fn cancel_replicas(
        &mut self,
        objects: &[MeshObjectId],
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        self.request(host, desired, |policy, ctx| policy.cancel_replicas(ctx, objects))
    }

    pub fn freshen(
        &mut self,
        objects: &[MeshObjectId],
        desired: Option<Duration>,
        host: &mut dyn ReplicaHost,
    ) -> Duration {
        self.request(host, desired, |policy, ctx| policy.freshen(ctx, objects))
    }

    /// Ship the objects to the partner, used after a shadow refresh
    pub fn convey(&mut self, objects: &[MeshObjectId], host: &mut dyn ReplicaHost) {
        let instructions = {
            let replicas = host.replicas();
            let mut out = ProxyProcessingInstructions::new();
            let payloads = objects
                .iter()
                .filter_map(|id| replicas.get(id))
                .map(|replica| replica.to_payload())
                .collect();
            out.send(Operation::ConveyReplicas(payloads));
            out.into_option()
        };
        self.perform(instructions, host);
    }

    /// The local mesh base committed a transaction
    pub fn transaction_committed(&mut self, transaction: &CommittedTransaction, host: &mut dyn ReplicaHost) {
        let instructions = self.decide(host, |policy, ctx| {
            policy.transaction_committed(ctx, transaction)
        });
        self.perform(instructions, host);
    }

    fn request(
        &mut self,
        host: &mut dyn ReplicaHost,
        desired: Option<Duration>,
        decide: impl FnOnce(&dyn ProxyPolicy, &PolicyContext<'_>) -> Option<ProxyProcessingInstructions>,
    ) -> Duration {
        let instructions = self.decide(host, decide);
        self.perform(instructions, host);
        desired.unwrap_or_else(|| self.deps.config.default_rpc_wait())
    }

    fn decide(
        &self,
        host: &dyn ReplicaHost,
        decide: impl FnOnce(&dyn ProxyPolicy, &PolicyContext<'_>) -> Option<ProxyProcessingInstructions>,
    ) -> Option<ProxyProcessingInstructions> {
        if self.state != ProxyState::Active {
            debug!("Proxy {} -> {} is {}, not deciding", self.own, self.partner, self.state);
            return None;
        }
        let replicas = host.replicas();
        let ctx = PolicyContext {
            own: &self.own,
            partner: &self.partner,
            replicas: &replicas,
            writable: host.writable(),
        };
        decide(self.policy.as_ref(), &ctx)
    }

    /// Apply effects now, queue outgoing operations for the next flush
    fn perform(&mut self, instructions: Option<ProxyProcessingInstructions>, host: &mut dyn ReplicaHost) {
        let Some(instructions) = instructions else {
            return;
        };
        for effect in instructions.effects {
            match effect {
                LocalEffect::ResynchronizeFailed { objects, reason } => {
                    self.resynchronize_failed(objects, reason, host)
                }
                other => host.apply(&self.partner, other),
            }
        }
        if !instructions.outgoing.is_empty() {
            self.outgoing
                .get_or_insert_with(Vec::new)
                .extend(instructions.outgoing);
            self.schedule_flush();
        }
        self.time_updated = now_millis();
    }

    /// Objects we asked to resynchronize are gone at the partner
    fn resynchronize_failed(&mut self, objects: Vec<MeshObjectId>, reason: String, host: &mut dyn ReplicaHost) {
        let asked: Vec<MeshObjectId> = objects
            .into_iter()
            .filter(|id| host.is_pending(&PendingKey::Resync(id.clone())))
            .collect();
        if asked.is_empty() {
            return;
        }
        let event = InitiateResynchronizeFailedEvent {
            proxy: self.own.clone(),
            partner: self.partner.clone(),
            objects: asked.clone(),
            reason,
        };
        if !self
            .listeners
            .fire(|l| l.initiate_resynchronize_failed(&event))
        {
            warn!(
                "Resynchronization of {} objects from {} failed: {}",
                asked.len(),
                self.partner,
                event.reason
            );
        }
        for id in asked {
            host.apply(
                &self.partner,
                LocalEffect::Complete {
                    key: PendingKey::Resync(id.clone()),
                    result: Err(AccessError::NotFound(id)),
                },
            );
        }
    }

    fn schedule_flush(&mut self) {
        if self.flush_timer.is_some() {
            return;
        }
        self.flush_generation += 1;
        let event = TimerEvent {
            partner: self.partner.clone(),
            kind: TimerKind::Flush,
            generation: self.flush_generation,
        };
        let timers = self.deps.timers.clone();
        self.flush_timer = Some(self.deps.scheduler.schedule_once(self.deps.flush_delay, async move {
            let _ = timers.send(event);
        }));
    }

    fn cancel_flush_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            self.deps.scheduler.cancel(&timer);
        }
    }

    pub async fn on_flush_timer(&mut self, generation: u64) {
        if generation != self.flush_generation {
            return;
        }
        self.flush_timer = None;
        self.flush().await;
    }

    /// Hand the batch to the endpoint as one message
    pub async fn flush(&mut self) {
        self.cancel_flush_timer();
        let Some(operations) = self.outgoing.take() else {
            return;
        };
        if operations.is_empty() {
            return;
        }
        let count = operations.len();
        match self.endpoint.enqueue(operations).await {
            Ok(token) => debug!(
                "Proxy {} -> {}: {} operations as token {}",
                self.own, self.partner, count, token
            ),
            Err(e) => warn!(
                "Proxy {} -> {}: dropping {} operations: {}",
                self.own, self.partner, count, e
            ),
        }
    }

    pub async fn on_endpoint_timer(&mut self, kind: TimerKind, generation: u64) {
        self.endpoint.on_timer(kind, generation).await;
    }

    /// A message arrived from the partner
    pub async fn incoming_message(&mut self, message: ProtocolMessage, host: &mut dyn ReplicaHost) {
        if self.state == ProxyState::Dead {
            return;
        }
        let Some(operations) = self.endpoint.receive(message).await else {
            return;
        };
        self.time_read = now_millis();
        let instructions = self.decide(host, |policy, ctx| policy.incoming_operations(ctx, operations));
        self.perform(instructions, host);
    }

    /// Report what the endpoint went through. Returns whether the proxy is dead.
    pub fn handle_endpoint_events(&mut self, host: &mut dyn ReplicaHost) -> bool {
        for event in self.endpoint.take_events() {
            match event {
                EndpointEvent::SendFailed {
                    tokens,
                    error,
                    exhausted,
                    fatal,
                } => {
                    let event = SendFailedEvent {
                        proxy: self.own.clone(),
                        partner: self.partner.clone(),
                        tokens,
                        error,
                        exhausted,
                        fatal,
                    };
                    if !self.listeners.fire(|l| l.send_failed(&event)) {
                        warn!(
                            "Proxy {} -> {}: send of {:?} failed: {}",
                            self.own, self.partner, event.tokens, event.error
                        );
                    }
                    if fatal {
                        host.apply(&self.partner, LocalEffect::FailPending(event.error.to_string()));
                    }
                }
                EndpointEvent::Halted => {
                    // the pair cannot recover; a later request starts a fresh one
                    info!("Proxy {} -> {} halted", self.own, self.partner);
                    self.cancel_flush_timer();
                    self.outgoing = None;
                    self.state = ProxyState::Dead;
                }
                EndpointEvent::Drained => {
                    info!("Proxy {} -> {} drained", self.own, self.partner);
                    self.state = ProxyState::Dead;
                }
            }
        }
        self.state == ProxyState::Dead
    }

    /// End the relationship. A permanent death cancels every lease and stops
    /// at once; otherwise the proxy drains outstanding traffic first.
    pub async fn die(&mut self, permanent: bool, host: &mut dyn ReplicaHost) {
        if self.state == ProxyState::Dead {
            return;
        }
        let instructions = self.decide(host, |policy, ctx| policy.dying(ctx, permanent));
        self.perform(instructions, host);
        self.flush().await;
        if permanent {
            self.endpoint.die();
            self.state = ProxyState::Dead;
        } else {
            self.endpoint.graceful_die().await;
            self.state = if self.endpoint.state() == EndpointState::Dead {
                ProxyState::Dead
            } else {
                ProxyState::Dying
            };
        }
        info!(
            "Proxy {} -> {} {} ({})",
            self.own,
            self.partner,
            self.state,
            if permanent { "permanent" } else { "graceful" }
        );
    }
}
