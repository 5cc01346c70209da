//! Report synthesis: turns a segmented batch into an RT Structure Set.

pub mod rtstruct;

pub use rtstruct::{ContourEntry, ReportObject, ReportSynthesizer};
