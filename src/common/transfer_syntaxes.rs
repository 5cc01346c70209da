//! Transfer syntaxes the node negotiates, with their codecs.
//!
//! Only native (uncompressed) encodings are accepted so pixel data reaches the
//! segmentation backend without a decoder.

use dicom::encoding::TransferSyntax;
use dicom_transfer_syntax_registry::entries;

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

#[derive(Debug, Clone)]
pub struct TransferSyntaxInfo {
    pub uid: &'static str,
    pub name: &'static str,
    pub is_little_endian: bool,
    pub is_explicit_vr: bool,
}

impl TransferSyntaxInfo {
    pub const fn new(
        uid: &'static str,
        name: &'static str,
        is_little_endian: bool,
        is_explicit_vr: bool,
    ) -> Self {
        Self {
            uid,
            name,
            is_little_endian,
            is_explicit_vr,
        }
    }
}

/// Accepted transfer syntaxes, in order of preference
#[derive(Debug, Default)]
pub struct TransferSyntaxCatalog;

impl TransferSyntaxCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn get(&self, uid: &str) -> Option<&'static TransferSyntaxInfo> {
        let uid = trim_uid(uid);
        NATIVE_TRANSFER_SYNTAXES.iter().find(|ts| ts.uid == uid)
    }

    pub fn get_all_uids(&self) -> Vec<&'static str> {
        NATIVE_TRANSFER_SYNTAXES.iter().map(|ts| ts.uid).collect()
    }

    pub fn is_supported(&self, uid: &str) -> bool {
        self.get(uid).is_some()
    }

    pub fn get_name(&self, uid: &str) -> Option<&'static str> {
        self.get(uid).map(|ts| ts.name)
    }

    /// Codec for an accepted transfer syntax
    pub fn codec(&self, uid: &str) -> Option<TransferSyntax> {
        match self.get(uid)?.uid {
            IMPLICIT_VR_LITTLE_ENDIAN => Some(entries::IMPLICIT_VR_LITTLE_ENDIAN.erased()),
            EXPLICIT_VR_LITTLE_ENDIAN => Some(entries::EXPLICIT_VR_LITTLE_ENDIAN.erased()),
            EXPLICIT_VR_BIG_ENDIAN => Some(entries::EXPLICIT_VR_BIG_ENDIAN.erased()),
            _ => None,
        }
    }
}

/// UIDs on the wire are padded to even length with NUL
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches('\0').trim()
}

const NATIVE_TRANSFER_SYNTAXES: &[TransferSyntaxInfo] = &[
    TransferSyntaxInfo::new(EXPLICIT_VR_LITTLE_ENDIAN, "Explicit VR Little Endian", true, true),
    TransferSyntaxInfo::new(IMPLICIT_VR_LITTLE_ENDIAN, "Implicit VR Little Endian", true, false),
    TransferSyntaxInfo::new(EXPLICIT_VR_BIG_ENDIAN, "Explicit VR Big Endian (Retired)", false, true),
];
