// Proxy events, delivered to registered listeners

use crate::comm::TransportError;
use crate::identifier::{MeshBaseId, MeshObjectId};
use crate::listener::ListenerSet;

/// Sending to the partner failed
#[derive(Debug, Clone, PartialEq)]
pub struct SendFailedEvent {
    /// Mesh base owning the proxy
    pub proxy: MeshBaseId,
    pub partner: MeshBaseId,
    pub tokens: Vec<u64>,
    pub error: TransportError,
    /// Retransmission gave up; the messages are still queued
    pub exhausted: bool,
    /// The proxy can no longer talk to the partner
    pub fatal: bool,
}

/// The partner could not resynchronize objects we asked for
#[derive(Debug, Clone, PartialEq)]
pub struct InitiateResynchronizeFailedEvent {
    pub proxy: MeshBaseId,
    pub partner: MeshBaseId,
    pub objects: Vec<MeshObjectId>,
    pub reason: String,
}

#[cfg_attr(test, mockall::automock)]
pub trait ProxyListener: Send + Sync {
    fn send_failed(&self, event: &SendFailedEvent);

    fn initiate_resynchronize_failed(&self, event: &InitiateResynchronizeFailedEvent);
}

pub type ProxyListeners = ListenerSet<dyn ProxyListener>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_listener_receives_event() {
        let mut mock = MockProxyListener::new();
        mock.expect_send_failed()
            .withf(|event| event.fatal && event.tokens == vec![1, 2])
            .times(1)
            .return_const(());

        let listeners = ProxyListeners::new();
        let listener: Arc<dyn ProxyListener> = Arc::new(mock);
        listeners.add_direct(listener);

        let partner = MeshBaseId::new("local:b").unwrap();
        let fired = listeners.fire(|l| {
            l.send_failed(&SendFailedEvent {
                proxy: MeshBaseId::new("local:a").unwrap(),
                partner: partner.clone(),
                tokens: vec![1, 2],
                error: TransportError::Rejected("no".to_string()),
                exhausted: false,
                fatal: true,
            })
        });
        assert!(fired);
    }
}
