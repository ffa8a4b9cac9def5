// Probes: data-source adapters, shadow mesh bases and their scheduling

pub mod adapter;
pub mod coherence;
pub mod manager;
pub mod schedule;
pub mod shadow;

pub use adapter::{
    JsonFileProbe, MemoryProbe, Probe, ProbeContext, ProbeDirectory, ProbeError, ProbeOutput,
};
pub use coherence::{CoherenceSpecification, RunOutcome};
pub use manager::{ProbeManager, UpdateOutcome};
pub use schedule::ProbeUpdateSpecification;
pub use shadow::{ShadowListener, ShadowListeners, ShadowMeshBase};
