//! Query identifiers and data set collaborator seams.
//!
//! Full data set handling is outside this stack:
//! pixel transcoding and SOP-class-specific validation
//! are delegated to collaborators through the traits below.
//! Query identifiers, however, are flat attribute lists
//! this crate can encode on its own
//! in Explicit or Implicit VR Little Endian,
//! whichever the presentation context negotiation settles on.

use std::collections::BTreeMap;
use std::str::FromStr;

use dicomnet_core::tag::tags;
use dicomnet_core::{Tag, VR};
use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("unsupported transfer syntax {} for identifier encoding", uid))]
    UnsupportedTransferSyntax { uid: String },

    /// the identifier carries no query/retrieve level
    MissingLevel,

    #[snafu(display("level {:?} is not defined in the {:?} information model", level, model))]
    LevelNotSupported {
        level: QueryRetrieveLevel,
        model: InformationModel,
    },

    #[snafu(display("unknown query/retrieve level `{}`", value))]
    UnknownLevel { value: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The (0008,0052) Query/Retrieve Level of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl QueryRetrieveLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryRetrieveLevel::Patient => "PATIENT",
            QueryRetrieveLevel::Study => "STUDY",
            QueryRetrieveLevel::Series => "SERIES",
            QueryRetrieveLevel::Image => "IMAGE",
        }
    }
}

impl FromStr for QueryRetrieveLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_end() {
            "PATIENT" => Ok(QueryRetrieveLevel::Patient),
            "STUDY" => Ok(QueryRetrieveLevel::Study),
            "SERIES" => Ok(QueryRetrieveLevel::Series),
            "IMAGE" => Ok(QueryRetrieveLevel::Image),
            other => UnknownLevelSnafu { value: other }.fail(),
        }
    }
}

/// The query/retrieve information model negotiated for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InformationModel {
    PatientRoot,
    StudyRoot,
}

impl InformationModel {
    /// The FIND SOP class of this information model.
    pub fn find_sop_class(self) -> &'static str {
        match self {
            InformationModel::PatientRoot => {
                dicomnet_core::uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            InformationModel::StudyRoot => {
                dicomnet_core::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
        }
    }

    /// The MOVE SOP class of this information model.
    pub fn move_sop_class(self) -> &'static str {
        match self {
            InformationModel::PatientRoot => {
                dicomnet_core::uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
            }
            InformationModel::StudyRoot => {
                dicomnet_core::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
            }
        }
    }

    /// The GET SOP class of this information model.
    pub fn get_sop_class(self) -> &'static str {
        match self {
            InformationModel::PatientRoot => {
                dicomnet_core::uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET
            }
            InformationModel::StudyRoot => {
                dicomnet_core::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET
            }
        }
    }

    /// Whether the given query/retrieve level
    /// is defined in this information model.
    pub fn supports(self, level: QueryRetrieveLevel) -> bool {
        match self {
            // the patient root model starts at the patient level
            InformationModel::PatientRoot => true,
            // the study root model starts at the study level
            InformationModel::StudyRoot => level != QueryRetrieveLevel::Patient,
        }
    }
}

/// A flat query identifier:
/// attribute values keyed by tag, in ascending tag order,
/// without sequences.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlatIdentifier {
    elements: BTreeMap<Tag, (VR, Vec<u8>)>,
}

impl FlatIdentifier {
    pub fn new() -> Self {
        FlatIdentifier::default()
    }

    /// Insert a string attribute,
    /// padded to even length per the VR's padding byte.
    pub fn put_str(&mut self, tag: Tag, vr: VR, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() % 2 != 0 {
            bytes.push(vr.padding_byte());
        }
        self.elements.insert(tag, (vr, bytes));
    }

    /// Insert a raw attribute value; the caller keeps it even-length.
    pub fn put(&mut self, tag: Tag, vr: VR, value: Vec<u8>) {
        self.elements.insert(tag, (vr, value));
    }

    /// Set the (0008,0052) Query/Retrieve Level.
    pub fn set_level(&mut self, level: QueryRetrieveLevel) {
        self.put_str(tags::QUERY_RETRIEVE_LEVEL, VR::CS, level.as_str());
    }

    /// Read the (0008,0052) Query/Retrieve Level, if present and valid.
    pub fn level(&self) -> Option<QueryRetrieveLevel> {
        let (_, value) = self.elements.get(&tags::QUERY_RETRIEVE_LEVEL)?;
        std::str::from_utf8(value).ok()?.trim().parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over the attributes in ascending tag order.
    pub fn iter(&self) -> impl Iterator<Item = (Tag, VR, &[u8])> {
        self.elements
            .iter()
            .map(|(tag, (vr, value))| (*tag, *vr, value.as_slice()))
    }

    /// Encode the identifier for the given negotiated transfer syntax.
    ///
    /// Explicit VR Little Endian is used when negotiated,
    /// Implicit VR Little Endian otherwise;
    /// compressed transfer syntaxes carry data sets this crate
    /// cannot produce.
    pub fn encode_for(&self, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
        match transfer_syntax_uid {
            dicomnet_core::uids::EXPLICIT_VR_LITTLE_ENDIAN => Ok(self.encode_explicit_le()),
            dicomnet_core::uids::IMPLICIT_VR_LITTLE_ENDIAN => Ok(self.encode_implicit_le()),
            uid => UnsupportedTransferSyntaxSnafu { uid }.fail(),
        }
    }

    /// Encode the identifier in Implicit VR Little Endian.
    pub fn encode_implicit_le(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, _vr, value) in self.iter() {
            out.extend_from_slice(&tag.group().to_le_bytes());
            out.extend_from_slice(&tag.element().to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        out
    }

    /// Encode the identifier in Explicit VR Little Endian.
    pub fn encode_explicit_le(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, vr, value) in self.iter() {
            out.extend_from_slice(&tag.group().to_le_bytes());
            out.extend_from_slice(&tag.element().to_le_bytes());
            out.extend_from_slice(&vr.to_bytes());
            if vr.has_explicit_4_byte_length() {
                // 2 reserved bytes, then a 4 byte length
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            } else {
                out.extend_from_slice(&(value.len() as u16).to_le_bytes());
            }
            out.extend_from_slice(value);
        }
        out
    }

    /// Check that the identifier is fit for the given information model:
    /// the level attribute must be present
    /// and defined in the model.
    pub fn check_level(&self, model: InformationModel) -> Result<QueryRetrieveLevel> {
        let level = self.level().ok_or(Error::MissingLevel)?;
        if !model.supports(level) {
            return LevelNotSupportedSnafu { level, model }.fail();
        }
        Ok(level)
    }
}

/// External collaborator: full data set encoding,
/// beyond the flat identifiers this crate handles itself.
pub trait DataSetCodec {
    /// Encode the identifier under the given transfer syntax.
    fn encode_identifier(
        &self,
        identifier: &FlatIdentifier,
        transfer_syntax_uid: &str,
    ) -> Result<Vec<u8>>;
}

/// The built-in identifier codec:
/// handles the uncompressed little endian transfer syntaxes.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatIdentifierCodec;

impl DataSetCodec for FlatIdentifierCodec {
    fn encode_identifier(
        &self,
        identifier: &FlatIdentifier,
        transfer_syntax_uid: &str,
    ) -> Result<Vec<u8>> {
        identifier.encode_for(transfer_syntax_uid)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("could not transcode from {} to {}: {}", from, to, message))]
pub struct TranscodeError {
    pub from: String,
    pub to: String,
    pub message: String,
}

/// External collaborator: pixel data transcoding between
/// transfer syntaxes.
pub trait Transcoder {
    /// Transcode a data set between the given transfer syntaxes.
    fn transcode(
        &self,
        data: &[u8],
        from_transfer_syntax: &str,
        to_transfer_syntax: &str,
    ) -> Result<Vec<u8>, TranscodeError>;

    /// Transfer syntaxes worth proposing as fallbacks
    /// when the peer does not accept the instance's own.
    fn fallback_transfer_syntaxes(&self, from_transfer_syntax: &str) -> Vec<String>;
}

#[derive(Debug, Snafu)]
#[snafu(display("data set does not conform to SOP class {}: {}", sop_class_uid, message))]
pub struct ValidationError {
    pub sop_class_uid: String,
    pub message: String,
}

/// External collaborator: SOP-class-specific attribute validation.
pub trait DataSetValidator {
    fn validate(&self, sop_class_uid: &str, data: &[u8]) -> Result<(), ValidationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_encodes_in_ascending_tag_order() {
        let mut identifier = FlatIdentifier::new();
        identifier.put_str(Tag(0x0010, 0x0010), VR::PN, "DOE^JOHN");
        identifier.set_level(QueryRetrieveLevel::Study);
        identifier.put_str(Tag(0x0008, 0x0020), VR::DA, "20240101");

        let tags: Vec<_> = identifier.iter().map(|(tag, _, _)| tag).collect();
        assert_eq!(
            tags,
            vec![
                Tag(0x0008, 0x0020),
                Tag(0x0008, 0x0052),
                Tag(0x0010, 0x0010),
            ]
        );
    }

    #[test]
    fn explicit_le_framing() {
        let mut identifier = FlatIdentifier::new();
        identifier.put_str(Tag(0x0008, 0x0050), VR::SH, "ACC42");

        let bytes = identifier.encode_explicit_le();
        // tag, VR code, u16 length, padded value
        assert_eq!(&bytes[0..4], &[0x08, 0x00, 0x50, 0x00]);
        assert_eq!(&bytes[4..6], b"SH");
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 6);
        assert_eq!(&bytes[8..14], b"ACC42 ");
    }

    #[test]
    fn implicit_le_framing() {
        let mut identifier = FlatIdentifier::new();
        identifier.put_str(Tag(0x0008, 0x0050), VR::SH, "ACC42");

        let bytes = identifier.encode_implicit_le();
        assert_eq!(&bytes[0..4], &[0x08, 0x00, 0x50, 0x00]);
        assert_eq!(
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            6
        );
        assert_eq!(&bytes[8..14], b"ACC42 ");
    }

    #[test]
    fn encode_for_rejects_compressed_transfer_syntaxes() {
        let identifier = FlatIdentifier::new();
        assert!(matches!(
            identifier.encode_for(dicomnet_core::uids::JPEG_BASELINE),
            Err(Error::UnsupportedTransferSyntax { .. })
        ));
    }

    #[test]
    fn level_checks_against_information_model() {
        let mut identifier = FlatIdentifier::new();
        assert_eq!(
            identifier.check_level(InformationModel::StudyRoot),
            Err(Error::MissingLevel)
        );

        identifier.set_level(QueryRetrieveLevel::Patient);
        assert!(matches!(
            identifier.check_level(InformationModel::StudyRoot),
            Err(Error::LevelNotSupported { .. })
        ));
        assert_eq!(
            identifier.check_level(InformationModel::PatientRoot),
            Ok(QueryRetrieveLevel::Patient)
        );

        identifier.set_level(QueryRetrieveLevel::Series);
        assert_eq!(
            identifier.check_level(InformationModel::StudyRoot),
            Ok(QueryRetrieveLevel::Series)
        );
    }
}
