//! Inbound side of the node: association handling and DIMSE message reassembly.

pub mod assembly;
#[allow(clippy::module_inception)]
mod receiver;

pub use assembly::{DimseMessage, MessageAssembler};
pub use receiver::AssociationManager;
