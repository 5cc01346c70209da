//! Destination registry, pending reports and the forwarder that delivers to the active destination.

pub mod forwarder;
pub mod pending;
pub mod registry;

pub use forwarder::{Delivery, Forwarder, ResendSummary};
pub use pending::{PendingReport, PendingStore};
pub use registry::{DestinationRegistry, Endpoint};
