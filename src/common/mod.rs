pub mod dimse;
pub mod sop_classes;
pub mod transfer_syntaxes;
pub mod types;
