//! SOP classes accepted by the node.
//!
//! Verification plus the volumetric image storage classes a segmentation backend can consume,
//! and the RT classes so structure sets can be looped back for testing.

use std::collections::HashMap;

pub const VERIFICATION: &str = "1.2.840.10008.1.1";
pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
pub const RT_STRUCTURE_SET_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.3";

#[derive(Debug, Clone)]
pub struct SopClassInfo {
    pub uid: &'static str,
    pub name: &'static str,
    pub category: SopClassCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SopClassCategory {
    Verification,
    ComputedTomography,
    MagneticResonance,
    PetCt,
    SecondaryCapture,
    Radiotherapy,
}

impl SopClassInfo {
    pub const fn new(uid: &'static str, name: &'static str, category: SopClassCategory) -> Self {
        Self { uid, name, category }
    }

    /// Image classes carry pixel data that can be segmented
    pub fn is_image(&self) -> bool {
        !matches!(
            self.category,
            SopClassCategory::Verification | SopClassCategory::Radiotherapy
        ) || self.uid == "1.2.840.10008.5.1.4.1.1.481.1"
    }
}

#[derive(Debug)]
pub struct SopClassRegistry {
    classes: HashMap<&'static str, SopClassInfo>,
}

impl SopClassRegistry {
    pub fn new() -> Self {
        let classes = ALL_SOP_CLASSES
            .iter()
            .map(|sop_class| (sop_class.uid, sop_class.clone()))
            .collect();
        Self { classes }
    }

    pub fn get(&self, uid: &str) -> Option<&SopClassInfo> {
        self.classes.get(uid)
    }

    /// Abstract syntaxes offered during negotiation, in a stable order
    pub fn get_all_uids(&self) -> Vec<&'static str> {
        ALL_SOP_CLASSES.iter().map(|sc| sc.uid).collect()
    }

    pub fn get_by_category(&self, category: SopClassCategory) -> Vec<&SopClassInfo> {
        ALL_SOP_CLASSES
            .iter()
            .filter(|sc| sc.category == category)
            .filter_map(|sc| self.classes.get(sc.uid))
            .collect()
    }

    pub fn is_supported(&self, uid: &str) -> bool {
        self.classes.contains_key(uid)
    }

    pub fn get_name(&self, uid: &str) -> Option<&'static str> {
        self.get(uid).map(|sc| sc.name)
    }
}

impl Default for SopClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const ALL_SOP_CLASSES: &[SopClassInfo] = &[
    SopClassInfo::new(VERIFICATION, "Verification SOP Class", SopClassCategory::Verification),
    // Computed Tomography
    SopClassInfo::new(CT_IMAGE_STORAGE, "CT Image Storage", SopClassCategory::ComputedTomography),
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.2.1",
        "Enhanced CT Image Storage",
        SopClassCategory::ComputedTomography,
    ),
    // Magnetic Resonance
    SopClassInfo::new(MR_IMAGE_STORAGE, "MR Image Storage", SopClassCategory::MagneticResonance),
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.4.1",
        "Enhanced MR Image Storage",
        SopClassCategory::MagneticResonance,
    ),
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.4.3",
        "Enhanced MR Color Image Storage",
        SopClassCategory::MagneticResonance,
    ),
    // PET
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.128",
        "Positron Emission Tomography Image Storage",
        SopClassCategory::PetCt,
    ),
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.130",
        "Enhanced PET Image Storage",
        SopClassCategory::PetCt,
    ),
    // Secondary Capture
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.7",
        "Secondary Capture Image Storage",
        SopClassCategory::SecondaryCapture,
    ),
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.7.2",
        "Multi-frame Grayscale Byte Secondary Capture Image Storage",
        SopClassCategory::SecondaryCapture,
    ),
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.7.3",
        "Multi-frame Grayscale Word Secondary Capture Image Storage",
        SopClassCategory::SecondaryCapture,
    ),
    // Radiotherapy
    SopClassInfo::new(
        "1.2.840.10008.5.1.4.1.1.481.1",
        "RT Image Storage",
        SopClassCategory::Radiotherapy,
    ),
    SopClassInfo::new(
        RT_STRUCTURE_SET_STORAGE,
        "RT Structure Set Storage",
        SopClassCategory::Radiotherapy,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_is_offered_first() {
        let registry = SopClassRegistry::new();
        assert_eq!(registry.get_all_uids()[0], VERIFICATION);
        assert_eq!(registry.get_all_uids().len(), ALL_SOP_CLASSES.len());
    }

    #[test]
    fn image_classes() {
        let registry = SopClassRegistry::new();
        assert!(registry.get(MR_IMAGE_STORAGE).unwrap().is_image());
        assert!(registry.get("1.2.840.10008.5.1.4.1.1.481.1").unwrap().is_image());
        assert!(!registry.get(RT_STRUCTURE_SET_STORAGE).unwrap().is_image());
        assert!(!registry.get(VERIFICATION).unwrap().is_image());
        assert_eq!(registry.get_by_category(SopClassCategory::MagneticResonance).len(), 3);
        assert!(!registry.is_supported("1.2.840.10008.5.1.4.1.1.88.11"));
    }
}
