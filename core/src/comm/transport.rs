// Transport: delivers encoded protocol frames between mesh bases
//
// The endpoint layer assumes nothing about delivery: frames may be lost,
// duplicated by retransmission or arrive after a gap. `LocalNetwork` is the
// in-process transport used by the CLI and the tests; it can lose frames and
// take mesh bases offline on demand.
//
// Sending never waits for a destination to come into existence. Frames for
// a destination a resolver is still materializing are held and released in
// order once it is attached; if it can never exist, each sender is told
// through its own inbox.

use crate::identifier::MeshBaseId;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transient: the destination could not be reached right now
    #[error("Destination unreachable: {0}")]
    Unreachable(MeshBaseId),
    /// Non-recoverable for this pair: the destination refused the traffic
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Already attached: {0}")]
    AlreadyAttached(MeshBaseId),
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same frame can never succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Rejected(_))
    }
}

/// An encoded protocol message in flight
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: MeshBaseId,
    pub bytes: Vec<u8>,
}

/// What arrives in a mesh base's inbox
#[derive(Debug, Clone)]
pub enum Delivery {
    Frame(Frame),
    /// Frames this mesh base sent to `to` can never be delivered
    Rejected { to: MeshBaseId, error: TransportError },
}

impl Delivery {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Delivery::Frame(frame) => Some(frame),
            Delivery::Rejected { .. } => None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Register a mesh base and return its inbox
    fn attach(&self, id: &MeshBaseId) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError>;

    fn detach(&self, id: &MeshBaseId);

    async fn send(&self, from: &MeshBaseId, to: &MeshBaseId, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// Materializes destinations that are not attached yet
#[async_trait]
pub trait PartnerResolver: Send + Sync {
    /// Whether `id` is one this resolver knows how to materialize
    fn claims(&self, id: &MeshBaseId) -> bool;

    /// Bring `id` up and attach it. `Rejected` when it can never exist.
    async fn resolve(&self, id: &MeshBaseId) -> Result<(), TransportError>;
}

#[derive(Default)]
struct Faults {
    drop_next: u32,
    offline: HashSet<MeshBaseId>,
}

/// In-process transport
pub struct LocalNetwork {
    me: Weak<LocalNetwork>,
    inboxes: RwLock<HashMap<MeshBaseId, mpsc::UnboundedSender<Delivery>>>,
    resolvers: RwLock<Vec<Weak<dyn PartnerResolver>>>,
    /// Frames held per destination while it is being resolved
    resolving: Mutex<HashMap<MeshBaseId, Vec<Frame>>>,
    faults: Mutex<Faults>,
    sent: RwLock<HashMap<MeshBaseId, u64>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inboxes: RwLock::new(HashMap::new()),
            resolvers: RwLock::new(Vec::new()),
            resolving: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            sent: RwLock::new(HashMap::new()),
        })
    }

    /// Add a resolver; the network does not keep it alive
    pub fn add_resolver(&self, resolver: Weak<dyn PartnerResolver>) {
        self.resolvers.write().push(resolver);
    }

    /// Silently lose the next `n` frames
    pub fn drop_next(&self, n: u32) {
        self.faults.lock().drop_next = n;
    }

    /// Make frames to `id` fail with `Unreachable`
    pub fn set_offline(&self, id: &MeshBaseId, offline: bool) {
        let mut faults = self.faults.lock();
        if offline {
            faults.offline.insert(id.clone());
        } else {
            faults.offline.remove(id);
        }
    }

    /// Frames `from` has attempted to send so far
    pub fn frames_sent_by(&self, from: &MeshBaseId) -> u64 {
        self.sent.read().get(from).copied().unwrap_or(0)
    }

    pub fn is_attached(&self, id: &MeshBaseId) -> bool {
        self.inboxes
            .read()
            .get(id)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Whether frames to `id` are held for a resolution in progress
    pub fn is_resolving(&self, id: &MeshBaseId) -> bool {
        self.resolving.lock().contains_key(id)
    }

    fn inbox(&self, id: &MeshBaseId) -> Option<mpsc::UnboundedSender<Delivery>> {
        self.inboxes
            .read()
            .get(id)
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    fn resolver_for(&self, id: &MeshBaseId) -> Option<Arc<dyn PartnerResolver>> {
        self.resolvers
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|resolver| resolver.claims(id))
    }

    /// Hold `frame` until `to` is resolved; the first held frame starts the
    /// resolution on its own task
    fn hold(&self, to: &MeshBaseId, frame: Frame, resolver: Arc<dyn PartnerResolver>) {
        let first = {
            let mut resolving = self.resolving.lock();
            let held = resolving.entry(to.clone()).or_default();
            held.push(frame);
            held.len() == 1
        };
        if !first {
            return;
        }
        let Some(network) = self.me.upgrade() else {
            return;
        };
        debug!("Resolving {}", to);
        let to = to.clone();
        tokio::spawn(async move {
            let result = resolver.resolve(&to).await;
            network.release(&to, result);
        });
    }

    fn release(&self, to: &MeshBaseId, result: Result<(), TransportError>) {
        // held under the lock so frames sent meanwhile queue up behind these
        let mut resolving = self.resolving.lock();
        let held = resolving.remove(to).unwrap_or_default();
        match result {
            Ok(()) => match self.inbox(to) {
                Some(inbox) => {
                    debug!("Resolved {}, releasing {} frames", to, held.len());
                    for frame in held {
                        if inbox.send(Delivery::Frame(frame)).is_err() {
                            warn!("Inbox of {} closed while releasing frames", to);
                            break;
                        }
                    }
                }
                None => warn!("{} resolved but not attached, {} frames lost", to, held.len()),
            },
            Err(error) => {
                warn!("Resolving {} failed: {}", to, error);
                if !error.is_fatal() {
                    // senders retransmit and resolution starts over
                    return;
                }
                let senders: BTreeSet<MeshBaseId> = held.into_iter().map(|frame| frame.from).collect();
                for from in senders {
                    if let Some(inbox) = self.inbox(&from) {
                        let _ = inbox.send(Delivery::Rejected {
                            to: to.clone(),
                            error: error.clone(),
                        });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    fn attach(&self, id: &MeshBaseId) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError> {
        let mut inboxes = self.inboxes.write();
        if let Some(existing) = inboxes.get(id) {
            if !existing.is_closed() {
                return Err(TransportError::AlreadyAttached(id.clone()));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(id.clone(), tx);
        debug!("Attached {} to local network", id);
        Ok(rx)
    }

    fn detach(&self, id: &MeshBaseId) {
        if self.inboxes.write().remove(id).is_some() {
            debug!("Detached {} from local network", id);
        }
    }

    async fn send(&self, from: &MeshBaseId, to: &MeshBaseId, bytes: Vec<u8>) -> Result<(), TransportError> {
        *self.sent.write().entry(from.clone()).or_insert(0) += 1;

        {
            let mut faults = self.faults.lock();
            if faults.offline.contains(to) {
                return Err(TransportError::Unreachable(to.clone()));
            }
            if faults.drop_next > 0 {
                faults.drop_next -= 1;
                debug!("Dropping frame {} -> {}", from, to);
                return Ok(());
            }
        }

        let frame = Frame {
            from: from.clone(),
            bytes,
        };
        if let Some(held) = self.resolving.lock().get_mut(to) {
            held.push(frame);
            return Ok(());
        }

        match self.inbox(to) {
            Some(inbox) => inbox.send(Delivery::Frame(frame)).map_err(|_| {
                warn!("Inbox of {} closed while sending from {}", to, from);
                TransportError::Unreachable(to.clone())
            }),
            None => {
                let resolver = self
                    .resolver_for(to)
                    .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
                self.hold(to, frame, resolver);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> MeshBaseId {
        MeshBaseId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_send_to_attached_inbox() {
        let net = LocalNetwork::new();
        let mut inbox = net.attach(&id("local:b")).unwrap();
        net.send(&id("local:a"), &id("local:b"), vec![1, 2, 3])
            .await
            .unwrap();

        let frame = inbox.recv().await.unwrap().into_frame().unwrap();
        assert_eq!(frame.from, id("local:a"));
        assert_eq!(frame.bytes, vec![1, 2, 3]);
        assert_eq!(net.frames_sent_by(&id("local:a")), 1);
    }

    #[tokio::test]
    async fn test_double_attach_rejected() {
        let net = LocalNetwork::new();
        let _inbox = net.attach(&id("local:b")).unwrap();
        assert_eq!(
            net.attach(&id("local:b")).err(),
            Some(TransportError::AlreadyAttached(id("local:b")))
        );
    }

    #[tokio::test]
    async fn test_unknown_destination_unreachable() {
        let net = LocalNetwork::new();
        let err = net
            .send(&id("local:a"), &id("local:nowhere"), vec![])
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Unreachable(id("local:nowhere")));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_faults() {
        let net = LocalNetwork::new();
        let mut inbox = net.attach(&id("local:b")).unwrap();

        net.drop_next(1);
        net.send(&id("local:a"), &id("local:b"), vec![1]).await.unwrap();
        net.send(&id("local:a"), &id("local:b"), vec![2]).await.unwrap();
        let frame = inbox.recv().await.unwrap().into_frame().unwrap();
        assert_eq!(frame.bytes, vec![2]);

        net.set_offline(&id("local:b"), true);
        assert!(net.send(&id("local:a"), &id("local:b"), vec![3]).await.is_err());
        net.set_offline(&id("local:b"), false);
        assert!(net.send(&id("local:a"), &id("local:b"), vec![4]).await.is_ok());
        assert_eq!(net.frames_sent_by(&id("local:a")), 4);
    }

    struct Materializer {
        net: Arc<LocalNetwork>,
        gate: tokio::sync::Notify,
        held: Mutex<Vec<mpsc::UnboundedReceiver<Delivery>>>,
    }

    #[async_trait]
    impl PartnerResolver for Materializer {
        fn claims(&self, id: &MeshBaseId) -> bool {
            matches!(id.scheme(), Some("file") | Some("fail"))
        }

        async fn resolve(&self, id: &MeshBaseId) -> Result<(), TransportError> {
            self.gate.notified().await;
            match id.scheme() {
                Some("file") => {
                    let inbox = self.net.attach(id)?;
                    self.held.lock().push(inbox);
                    Ok(())
                }
                _ => Err(TransportError::Rejected("adapter failed".to_string())),
            }
        }
    }

    fn materializer(net: &Arc<LocalNetwork>) -> Arc<Materializer> {
        let resolver = Arc::new(Materializer {
            net: net.clone(),
            gate: tokio::sync::Notify::new(),
            held: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn PartnerResolver> = resolver.clone();
        net.add_resolver(Arc::downgrade(&as_dyn));
        resolver
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_does_not_wait_for_resolution() {
        let net = LocalNetwork::new();
        let resolver = materializer(&net);
        let dest = id("file:///x.json");

        // resolution is gated, so these would hang if send awaited it
        net.send(&id("local:a"), &dest, vec![1]).await.unwrap();
        net.send(&id("local:c"), &dest, vec![2]).await.unwrap();
        assert!(net.is_resolving(&dest));
        assert!(!net.is_attached(&dest));

        resolver.gate.notify_one();
        settle().await;
        assert!(net.is_attached(&dest));
        assert!(!net.is_resolving(&dest));

        let mut inbox = resolver.held.lock().pop().unwrap();
        let first = inbox.recv().await.unwrap().into_frame().unwrap();
        let second = inbox.recv().await.unwrap().into_frame().unwrap();
        assert_eq!((first.from, first.bytes), (id("local:a"), vec![1]));
        assert_eq!((second.from, second.bytes), (id("local:c"), vec![2]));

        net.send(&id("local:a"), &dest, vec![3]).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap().into_frame().unwrap().bytes, vec![3]);
    }

    #[tokio::test]
    async fn test_failed_resolution_notifies_each_sender() {
        let net = LocalNetwork::new();
        let resolver = materializer(&net);
        let mut inbox_a = net.attach(&id("local:a")).unwrap();
        let dest = id("fail://x");

        net.send(&id("local:a"), &dest, vec![1]).await.unwrap();
        net.send(&id("local:a"), &dest, vec![2]).await.unwrap();
        resolver.gate.notify_one();
        settle().await;

        match inbox_a.recv().await.unwrap() {
            Delivery::Rejected { to, error } => {
                assert_eq!(to, dest);
                assert!(error.is_fatal());
            }
            other => panic!("expected a rejection, got {:?}", other),
        }
        // one notice per sender, not per frame
        assert!(inbox_a.try_recv().is_err());
        assert!(!net.is_resolving(&dest));
    }
}
