//! Outbound side of the node: C-ECHO and C-STORE as a service class user.

mod scu;

use async_trait::async_trait;
use dicom_object::DefaultDicomObject;

use crate::common::dimse::DimseStatus;
use crate::destinations::Endpoint;
use crate::error::Result;

pub use scu::DicomScu;

/// A way of talking to remote nodes
#[async_trait]
pub trait DicomPeer: Send + Sync {
    async fn echo(&self, endpoint: &Endpoint) -> Result<DimseStatus>;

    async fn store(&self, endpoint: &Endpoint, object: &DefaultDicomObject) -> Result<DimseStatus>;
}
