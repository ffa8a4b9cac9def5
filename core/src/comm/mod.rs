// Communication layer: transports and the ping-pong message endpoint

pub mod endpoint;
pub mod transport;

pub use endpoint::{
    EndpointDeps, EndpointError, EndpointEvent, EndpointState, ExternalizedEndpoint,
    MessageEndpoint, TimerEvent, TimerKind,
};
pub use transport::{Delivery, Frame, LocalNetwork, PartnerResolver, Transport, TransportError};
