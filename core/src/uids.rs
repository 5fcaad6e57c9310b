//! Well-known unique identifiers recognized by name.
//!
//! Only the identifiers this stack routes on are listed here;
//! compressed transfer syntaxes are carried as opaque identifiers
//! and never decoded.

/// Application context name: DICOM Application Context Name
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

// transfer syntaxes

/// Transfer syntax: Implicit VR Little Endian
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
/// Transfer syntax: Explicit VR Little Endian
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
/// Transfer syntax: Deflated Explicit VR Little Endian
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
/// Transfer syntax: Explicit VR Big Endian (retired)
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
/// Transfer syntax: JPEG Baseline (Process 1)
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
/// Transfer syntax: JPEG Extended (Process 2 & 4)
pub const JPEG_EXTENDED: &str = "1.2.840.10008.1.2.4.51";
/// Transfer syntax: JPEG Lossless, Non-Hierarchical (Process 14)
pub const JPEG_LOSSLESS_NON_HIERARCHICAL: &str = "1.2.840.10008.1.2.4.57";
/// Transfer syntax: JPEG Lossless, Non-Hierarchical, First-Order Prediction
pub const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";
/// Transfer syntax: JPEG-LS Lossless
pub const JPEG_LS_LOSSLESS: &str = "1.2.840.10008.1.2.4.80";
/// Transfer syntax: JPEG-LS Lossy (Near-Lossless)
pub const JPEG_LS_LOSSY: &str = "1.2.840.10008.1.2.4.81";
/// Transfer syntax: JPEG 2000 (Lossless Only)
pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
/// Transfer syntax: JPEG 2000
pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
/// Transfer syntax: MPEG2 Main Profile / Main Level
pub const MPEG2_MAIN_PROFILE: &str = "1.2.840.10008.1.2.4.100";
/// Transfer syntax: MPEG-4 AVC/H.264 High Profile / Level 4.1
pub const MPEG4_HIGH_PROFILE: &str = "1.2.840.10008.1.2.4.102";
/// Transfer syntax: RLE Lossless
pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";

// SOP classes

/// SOP class: Verification SOP Class
pub const VERIFICATION: &str = "1.2.840.10008.1.1";
/// SOP class: Patient Root Query/Retrieve Information Model - FIND
pub const PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND: &str =
    "1.2.840.10008.5.1.4.1.2.1.1";
/// SOP class: Patient Root Query/Retrieve Information Model - MOVE
pub const PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE: &str =
    "1.2.840.10008.5.1.4.1.2.1.2";
/// SOP class: Patient Root Query/Retrieve Information Model - GET
pub const PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET: &str =
    "1.2.840.10008.5.1.4.1.2.1.3";
/// SOP class: Study Root Query/Retrieve Information Model - FIND
pub const STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND: &str =
    "1.2.840.10008.5.1.4.1.2.2.1";
/// SOP class: Study Root Query/Retrieve Information Model - MOVE
pub const STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE: &str =
    "1.2.840.10008.5.1.4.1.2.2.2";
/// SOP class: Study Root Query/Retrieve Information Model - GET
pub const STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET: &str =
    "1.2.840.10008.5.1.4.1.2.2.3";

/// Whether the given transfer syntax UID carries data sets
/// in an uncompressed encoding this stack can produce itself.
pub fn is_codec_free(transfer_syntax_uid: &str) -> bool {
    matches!(
        transfer_syntax_uid,
        IMPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_LITTLE_ENDIAN | EXPLICIT_VR_BIG_ENDIAN
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_free_classification() {
        assert!(is_codec_free(IMPLICIT_VR_LITTLE_ENDIAN));
        assert!(is_codec_free(EXPLICIT_VR_LITTLE_ENDIAN));
        assert!(!is_codec_free(DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN));
        assert!(!is_codec_free(JPEG_BASELINE));
        assert!(!is_codec_free(RLE_LOSSLESS));
    }
}
