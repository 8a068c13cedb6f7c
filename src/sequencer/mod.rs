//! Dependency resolution and health-gated startup
//!
//! [`Sequencer`] is the only owner of the [`StateTable`]. Probes run as
//! separate tasks and report back to it; every other component reads
//! [`StackSnapshot`]s published on a watch channel.

pub mod coordinator;
pub mod graph;
pub mod probe;
pub mod state;

pub use coordinator::{Sequencer, SequencerOptions};
pub use graph::DependencyGraph;
pub use probe::{HealthEvent, Prober, StartupOutcome};
pub use state::{RuntimeState, ServiceStatus, StackSnapshot, StateTable, Transition};
