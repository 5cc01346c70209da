//! A DICOM node that receives image series, runs automatic segmentation on each complete
//! series and forwards the resulting RT Structure Set to a configured destination.

pub mod aggregator;
pub mod autocontour;
pub mod common;
pub mod config;
pub mod destinations;
pub mod error;
pub mod events;
pub mod node;
pub mod pipeline;
pub mod receiver;
pub mod report;
pub mod sender;
pub mod uid;

pub use config::{ConfigHandle, NodeConfig};
pub use error::{ModelError, NodeError, Result};
pub use events::{EventBus, NodeEvent};
pub use node::{AutocontourNode, NodeStatus};
