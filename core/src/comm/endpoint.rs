//! Ping-pong message endpoint
//!
//! A reliable, ordered, duplicate-suppressing channel between exactly two
//! mesh bases over a [`Transport`] that may lose frames.
//!
//! Every content message consumes one token from the sender's sequence
//! (strictly increasing from 1) and carries the highest token accepted from
//! the peer. Messages move from `pending` (not yet attempted) to
//! `unacknowledged` (sent, awaiting ack) and leave once the peer acks them.
//! Unacknowledged messages are re-sent after the round-trip timeout; after
//! `max_resends` fruitless rounds the endpoint reports exhaustion and stops
//! retrying on its own until new traffic flows.
//!
//! The endpoint never spawns work of its own: timers deliver a
//! [`TimerEvent`] to the owning mesh base, which calls [`MessageEndpoint::on_timer`].

use super::transport::{Transport, TransportError};
use crate::config::EndpointConfig;
use crate::identifier::MeshBaseId;
use crate::message::{Operation, ProtocolMessage};
use crate::scheduler::{jitter, Scheduler, TaskHandle};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    /// Queues kept, no traffic
    Idle,
    Communicating,
    /// Graceful death: outgoing traffic flushes, incoming content is refused
    Draining,
    /// Stopped by a non-recoverable transport failure
    Halted,
    Dead,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Idle => "idle",
            EndpointState::Communicating => "communicating",
            EndpointState::Draining => "draining",
            EndpointState::Halted => "halted",
            EndpointState::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EndpointError {
    #[error("Endpoint is {0} and does not accept new messages")]
    NotAccepting(EndpointState),
    #[error("Refusing to queue a message without operations")]
    EmptyMessage,
}

/// Which timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Resend,
    Ack,
    /// Proxy batch flush
    Flush,
}

/// Delivered to the owning mesh base when a timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub partner: MeshBaseId,
    pub kind: TimerKind,
    pub generation: u64,
}

/// Reported to the proxy owning the endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    SendFailed {
        tokens: Vec<u64>,
        error: TransportError,
        /// Retransmission gave up; messages stay queued
        exhausted: bool,
        /// The endpoint halted
        fatal: bool,
    },
    /// A graceful death completed
    Drained,
    Halted,
}

/// Persisted endpoint state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalizedEndpoint {
    pub last_sent_token: u64,
    pub last_received_token: u64,
    pub unacknowledged: Vec<ProtocolMessage>,
    pub pending: Vec<ProtocolMessage>,
}

/// What an endpoint needs from its surroundings
#[derive(Clone)]
pub struct EndpointDeps {
    pub transport: Arc<dyn Transport>,
    pub timers: mpsc::UnboundedSender<TimerEvent>,
    pub scheduler: Scheduler,
    pub config: EndpointConfig,
}

pub struct MessageEndpoint {
    own: MeshBaseId,
    partner: MeshBaseId,
    deps: EndpointDeps,
    state: EndpointState,
    last_sent_token: u64,
    last_received_token: u64,
    pending: VecDeque<ProtocolMessage>,
    unacknowledged: VecDeque<ProtocolMessage>,
    resend_timer: Option<TaskHandle>,
    ack_timer: Option<TaskHandle>,
    generation: u64,
    resend_generation: u64,
    ack_generation: u64,
    resend_rounds: u32,
    retry_paused: bool,
    ack_due: bool,
    last_error: Option<TransportError>,
    events: Vec<EndpointEvent>,
}

impl MessageEndpoint {
    pub fn new(own: MeshBaseId, partner: MeshBaseId, deps: EndpointDeps) -> Self {
        Self::restore(own, partner, ExternalizedEndpoint::default(), deps)
    }

    /// Recreate an endpoint from persisted state; it starts out idle
    pub fn restore(
        own: MeshBaseId,
        partner: MeshBaseId,
        record: ExternalizedEndpoint,
        deps: EndpointDeps,
    ) -> Self {
        Self {
            own,
            partner,
            deps,
            state: EndpointState::Idle,
            last_sent_token: record.last_sent_token,
            last_received_token: record.last_received_token,
            pending: record.pending.into(),
            unacknowledged: record.unacknowledged.into(),
            resend_timer: None,
            ack_timer: None,
            generation: 0,
            resend_generation: 0,
            ack_generation: 0,
            resend_rounds: 0,
            retry_paused: false,
            ack_due: false,
            last_error: None,
            events: Vec::new(),
        }
    }

    pub fn externalize(&self) -> ExternalizedEndpoint {
        ExternalizedEndpoint {
            last_sent_token: self.last_sent_token,
            last_received_token: self.last_received_token,
            unacknowledged: self.unacknowledged.iter().cloned().collect(),
            pending: self.pending.iter().cloned().collect(),
        }
    }

    pub fn partner(&self) -> &MeshBaseId {
        &self.partner
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn last_sent_token(&self) -> u64 {
        self.last_sent_token
    }

    pub fn last_received_token(&self) -> u64 {
        self.last_received_token
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn unacknowledged_len(&self) -> usize {
        self.unacknowledged.len()
    }

    /// Whether autonomous retransmission gave up
    pub fn is_retry_paused(&self) -> bool {
        self.retry_paused
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Communicating | EndpointState::Draining
        )
    }

    /// Events accumulated since the last call
    pub fn take_events(&mut self) -> Vec<EndpointEvent> {
        std::mem::take(&mut self.events)
    }

    pub async fn start_communicating(&mut self) {
        if self.state != EndpointState::Idle {
            return;
        }
        debug!("Endpoint {} -> {} communicating", self.own, self.partner);
        self.state = EndpointState::Communicating;
        self.transmit_pending().await;
        self.arm_resend(false);
    }

    pub fn stop_communicating(&mut self) {
        if self.state == EndpointState::Communicating {
            debug!("Endpoint {} -> {} idle", self.own, self.partner);
            self.state = EndpointState::Idle;
            self.cancel_timers();
        }
    }

    /// Queue a content message and send it if communicating. Returns its token.
    pub async fn enqueue(&mut self, operations: Vec<Operation>) -> Result<u64, EndpointError> {
        if operations.is_empty() {
            return Err(EndpointError::EmptyMessage);
        }
        if !matches!(
            self.state,
            EndpointState::Idle | EndpointState::Communicating
        ) {
            return Err(EndpointError::NotAccepting(self.state));
        }

        self.last_sent_token += 1;
        let token = self.last_sent_token;
        self.pending.push_back(ProtocolMessage {
            sender: self.own.clone(),
            receiver: self.partner.clone(),
            token_sent: token,
            token_acked: self.last_received_token,
            operations,
        });

        if self.state == EndpointState::Communicating {
            self.transmit_pending().await;
        }
        Ok(token)
    }

    /// Process a received message. Returns its operations if it carried new
    /// content in sequence.
    pub async fn receive(&mut self, message: ProtocolMessage) -> Option<Vec<Operation>> {
        if matches!(self.state, EndpointState::Dead | EndpointState::Halted) {
            debug!(
                "Endpoint {} -> {} is {}, ignoring token {}",
                self.own, self.partner, self.state, message.token_sent
            );
            return None;
        }
        if message.sender != self.partner {
            warn!(
                "Endpoint {} -> {} got a message from {}",
                self.own, self.partner, message.sender
            );
            return None;
        }

        self.process_ack(message.token_acked);

        if message.is_ack_only() {
            self.resume_paused_retry().await;
            self.check_drained();
            return None;
        }

        if self.state == EndpointState::Draining {
            debug!(
                "Endpoint {} -> {} draining, refusing token {}",
                self.own, self.partner, message.token_sent
            );
            self.resume_paused_retry().await;
            self.check_drained();
            return None;
        }

        let expected = self.last_received_token + 1;
        let accepted = if message.token_sent == expected {
            self.last_received_token = message.token_sent;
            Some(message.operations)
        } else if message.token_sent < expected {
            warn!(
                "Endpoint {} -> {}: duplicate token {} (last received {})",
                self.own, self.partner, message.token_sent, self.last_received_token
            );
            None
        } else {
            debug!(
                "Endpoint {} -> {}: gap, got token {} expecting {}",
                self.own, self.partner, message.token_sent, expected
            );
            None
        };

        // Duplicates and gaps are answered too, so the sender learns where we are
        self.ack_due = true;
        self.arm_ack();
        self.resume_paused_retry().await;
        accepted
    }

    pub async fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        match kind {
            TimerKind::Resend => {
                if generation != self.resend_generation {
                    return;
                }
                self.resend_timer = None;
                self.retransmit_round().await;
            }
            TimerKind::Ack => {
                if generation != self.ack_generation {
                    return;
                }
                self.ack_timer = None;
                if self.ack_due && self.is_active() {
                    self.send_ack().await;
                }
            }
            TimerKind::Flush => {}
        }
    }

    /// Stop accepting incoming content, flush everything outgoing, then die
    pub async fn graceful_die(&mut self) {
        match self.state {
            EndpointState::Idle | EndpointState::Communicating => {
                info!("Endpoint {} -> {} draining", self.own, self.partner);
                self.state = EndpointState::Draining;
                self.transmit_pending().await;
                self.arm_resend(false);
                self.check_drained();
            }
            EndpointState::Draining => {}
            EndpointState::Halted | EndpointState::Dead => self.die(),
        }
    }

    /// The transport reported that frames already handed to it can never
    /// reach the partner
    pub fn reject(&mut self, error: TransportError) {
        if matches!(self.state, EndpointState::Halted | EndpointState::Dead) {
            return;
        }
        self.halt(error);
    }

    /// Stop immediately; queues are kept for externalization
    pub fn die(&mut self) {
        if self.state != EndpointState::Dead {
            debug!("Endpoint {} -> {} dead", self.own, self.partner);
        }
        self.state = EndpointState::Dead;
        self.cancel_timers();
    }

    async fn transmit_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let first_new = if self.retry_paused {
            // new traffic gives the stalled messages another round
            self.retry_paused = false;
            self.resend_rounds = 0;
            0
        } else {
            self.unacknowledged.len()
        };
        self.unacknowledged.extend(self.pending.drain(..));
        self.send_from(first_new).await;
        self.arm_resend(false);
    }

    async fn retransmit_round(&mut self) {
        if !self.is_active() || self.unacknowledged.is_empty() {
            return;
        }
        if self.resend_rounds >= self.deps.config.max_resends {
            let tokens = self.unacknowledged_tokens();
            warn!(
                "Endpoint {} -> {}: giving up on tokens {:?} after {} resends",
                self.own, self.partner, tokens, self.resend_rounds
            );
            self.retry_paused = true;
            self.events.push(EndpointEvent::SendFailed {
                tokens,
                error: self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| TransportError::Unreachable(self.partner.clone())),
                exhausted: true,
                fatal: false,
            });
            return;
        }
        self.resend_rounds += 1;
        debug!(
            "Endpoint {} -> {}: resend round {} for {} messages",
            self.own,
            self.partner,
            self.resend_rounds,
            self.unacknowledged.len()
        );
        self.send_from(0).await;
        self.arm_resend(true);
    }

    async fn resume_paused_retry(&mut self) {
        if !self.retry_paused || !self.is_active() || self.unacknowledged.is_empty() {
            return;
        }
        self.retry_paused = false;
        self.resend_rounds = 0;
        self.send_from(0).await;
        self.arm_resend(true);
    }

    /// Send unacknowledged messages from `start` on, each with a fresh ack
    async fn send_from(&mut self, start: usize) {
        let messages: Vec<ProtocolMessage> =
            self.unacknowledged.iter().skip(start).cloned().collect();
        for mut message in messages {
            if !self.is_active() {
                break;
            }
            message.token_acked = self.last_received_token;
            if !self.transmit(&message, true).await {
                break;
            }
        }
        if self.is_active() {
            // content frames carry the ack
            self.ack_due = false;
            self.cancel_ack_timer();
        }
    }

    async fn send_ack(&mut self) {
        let ack = ProtocolMessage {
            sender: self.own.clone(),
            receiver: self.partner.clone(),
            token_sent: self.last_sent_token,
            token_acked: self.last_received_token,
            operations: Vec::new(),
        };
        self.ack_due = false;
        self.transmit(&ack, false).await;
    }

    /// Returns whether the frame left
    async fn transmit(&mut self, message: &ProtocolMessage, report: bool) -> bool {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode token {}: {}", message.token_sent, e);
                return false;
            }
        };
        match self
            .deps
            .transport
            .send(&self.own, &self.partner, bytes)
            .await
        {
            Ok(()) => true,
            Err(error) if error.is_fatal() => {
                self.halt(error);
                false
            }
            Err(error) => {
                debug!(
                    "Endpoint {} -> {}: send of token {} failed: {}",
                    self.own, self.partner, message.token_sent, error
                );
                self.last_error = Some(error.clone());
                if report {
                    self.events.push(EndpointEvent::SendFailed {
                        tokens: vec![message.token_sent],
                        error,
                        exhausted: false,
                        fatal: false,
                    });
                }
                false
            }
        }
    }

    fn halt(&mut self, error: TransportError) {
        warn!(
            "Endpoint {} -> {} halted: {}",
            self.own, self.partner, error
        );
        self.state = EndpointState::Halted;
        self.cancel_timers();
        self.retry_paused = false;
        self.events.push(EndpointEvent::SendFailed {
            tokens: self.unacknowledged_tokens(),
            error,
            exhausted: false,
            fatal: true,
        });
        self.events.push(EndpointEvent::Halted);
    }

    fn process_ack(&mut self, acked: u64) {
        let before = self.unacknowledged.len();
        while self
            .unacknowledged
            .front()
            .map(|m| m.token_sent <= acked)
            .unwrap_or(false)
        {
            self.unacknowledged.pop_front();
        }
        if self.unacknowledged.len() == before {
            return;
        }
        self.resend_rounds = 0;
        self.retry_paused = false;
        self.last_error = None;
        if self.unacknowledged.is_empty() {
            self.cancel_resend_timer();
        } else {
            self.arm_resend(true);
        }
    }

    fn check_drained(&mut self) {
        if self.state == EndpointState::Draining
            && self.pending.is_empty()
            && self.unacknowledged.is_empty()
        {
            info!("Endpoint {} -> {} drained", self.own, self.partner);
            self.state = EndpointState::Dead;
            self.cancel_timers();
            self.events.push(EndpointEvent::Drained);
        }
    }

    fn unacknowledged_tokens(&self) -> Vec<u64> {
        self.unacknowledged.iter().map(|m| m.token_sent).collect()
    }

    fn arm_resend(&mut self, restart: bool) {
        if !self.is_active() || self.unacknowledged.is_empty() || self.retry_paused {
            return;
        }
        if self.resend_timer.is_some() && !restart {
            return;
        }
        self.cancel_resend_timer();
        let delay = jitter(self.deps.config.resend(), self.deps.config.random_variation);
        let (generation, handle) = self.schedule(TimerKind::Resend, delay);
        self.resend_generation = generation;
        self.resend_timer = Some(handle);
    }

    fn arm_ack(&mut self) {
        if self.ack_timer.is_some() || !self.is_active() {
            return;
        }
        let delay = jitter(
            self.deps.config.respond_no_message(),
            self.deps.config.random_variation,
        );
        let (generation, handle) = self.schedule(TimerKind::Ack, delay);
        self.ack_generation = generation;
        self.ack_timer = Some(handle);
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) -> (u64, TaskHandle) {
        self.generation += 1;
        let event = TimerEvent {
            partner: self.partner.clone(),
            kind,
            generation: self.generation,
        };
        let timers = self.deps.timers.clone();
        let handle = self.deps.scheduler.schedule_once(delay, async move {
            let _ = timers.send(event);
        });
        (self.generation, handle)
    }

    fn cancel_resend_timer(&mut self) {
        if let Some(timer) = self.resend_timer.take() {
            self.deps.scheduler.cancel(&timer);
        }
        // a timer that already fired must not count
        self.resend_generation = 0;
    }

    fn cancel_ack_timer(&mut self) {
        if let Some(timer) = self.ack_timer.take() {
            self.deps.scheduler.cancel(&timer);
        }
        self.ack_generation = 0;
    }

    fn cancel_timers(&mut self) {
        self.cancel_resend_timer();
        self.cancel_ack_timer();
    }
}
