// Proxies: per-partner replication state, policies and their manager

pub mod event;
pub mod externalized;
pub mod instructions;
pub mod manager;
pub mod policy;
#[allow(clippy::module_inception)]
pub mod proxy;

pub use event::{
    InitiateResynchronizeFailedEvent, ProxyListener, ProxyListeners, SendFailedEvent,
};
pub use externalized::ExternalizedProxy;
pub use instructions::{
    group_by_proxy, LocalEffect, ProxyProcessingInstructions, ResynchronizeInstructions,
};
pub use manager::{ProxyError, ProxyFactory, ProxyInfo, ProxyManager};
pub use policy::{NiceAndTrustingPolicy, PolicyContext, PolicyRegistry, ProxyPolicy, ShadowPolicy};
pub use proxy::{Proxy, ProxyDeps, ProxyState, ReplicaHost};
