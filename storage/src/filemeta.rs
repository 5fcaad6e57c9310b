//! Extraction of the routed attributes
//! from the DICOM file meta information group.
//!
//! Only group 0002 is read here,
//! in Explicit VR Little Endian as the standard prescribes;
//! everything past the group boundary belongs
//! to the data set codec collaborator.

use byteordered::byteorder::{LittleEndian, ReadBytesExt};
use dicomnet_core::tag::tags;
use dicomnet_core::{Tag, VR};
use snafu::{OptionExt, ResultExt, Snafu};
use std::io::Read;

/// The magic code at offset 128 of a DICOM file.
const DICM_MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the payload carries no file meta group
    NotDicom,

    /// premature end of the file meta group
    ReadHeader { source: std::io::Error },

    #[snafu(display("could not read the value of {}", tag))]
    ReadValue {
        tag: Tag,
        source: std::io::Error,
    },

    #[snafu(display("file meta attribute {} is not a character string", tag))]
    InvalidString { tag: Tag },

    #[snafu(display("missing file meta attribute {}", tag))]
    MissingAttribute { tag: Tag },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The file meta attributes this stack routes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub media_storage_sop_class_uid: String,
    pub media_storage_sop_instance_uid: String,
    pub transfer_syntax_uid: String,
}

/// Extract the routed file meta attributes from the given payload.
///
/// The 128-byte preamble and `DICM` magic are honored when present;
/// payloads starting directly at group 0002 are accepted as well.
pub fn parse_file_meta(data: &[u8]) -> Result<FileMeta> {
    let body = if data.len() >= 132 && &data[128..132] == DICM_MAGIC {
        &data[132..]
    } else if data.len() >= 2 && data[0] == 0x02 && data[1] == 0x00 {
        data
    } else {
        return NotDicomSnafu.fail();
    };

    let mut cursor = std::io::Cursor::new(body);
    let mut sop_class_uid = None;
    let mut sop_instance_uid = None;
    let mut transfer_syntax_uid = None;
    // end of the group, as declared by (0002,0000)
    let mut limit: Option<u64> = None;

    loop {
        if let Some(end) = limit {
            if cursor.position() >= end {
                break;
            }
        }
        let group = match cursor.read_u16::<LittleEndian>() {
            Ok(group) => group,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context(ReadHeaderSnafu),
        };
        if group != 0x0002 {
            break;
        }
        let element = cursor.read_u16::<LittleEndian>().context(ReadHeaderSnafu)?;
        let tag = Tag(group, element);

        let mut vr_bytes = [0u8; 2];
        cursor.read_exact(&mut vr_bytes).context(ReadHeaderSnafu)?;
        let length = match VR::from_binary(vr_bytes) {
            Some(vr) if vr.has_explicit_4_byte_length() => {
                // 2 reserved bytes before the 4 byte length
                cursor.read_u16::<LittleEndian>().context(ReadHeaderSnafu)?;
                cursor.read_u32::<LittleEndian>().context(ReadHeaderSnafu)?
            }
            Some(_) => u32::from(cursor.read_u16::<LittleEndian>().context(ReadHeaderSnafu)?),
            // unknown VR codes carry a short length as well
            None => u32::from(cursor.read_u16::<LittleEndian>().context(ReadHeaderSnafu)?),
        };

        let mut value = vec![0; length as usize];
        cursor
            .read_exact(&mut value)
            .context(ReadValueSnafu { tag })?;

        match tag {
            tags::FILE_META_INFORMATION_GROUP_LENGTH => {
                if value.len() == 4 {
                    let declared = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
                    limit = Some(cursor.position() + u64::from(declared));
                }
            }
            tags::MEDIA_STORAGE_SOP_CLASS_UID => {
                sop_class_uid = Some(string_value(tag, value)?);
            }
            tags::MEDIA_STORAGE_SOP_INSTANCE_UID => {
                sop_instance_uid = Some(string_value(tag, value)?);
            }
            tags::TRANSFER_SYNTAX_UID => {
                transfer_syntax_uid = Some(string_value(tag, value)?);
            }
            _ => {}
        }
    }

    Ok(FileMeta {
        media_storage_sop_class_uid: sop_class_uid.context(MissingAttributeSnafu {
            tag: tags::MEDIA_STORAGE_SOP_CLASS_UID,
        })?,
        media_storage_sop_instance_uid: sop_instance_uid.context(MissingAttributeSnafu {
            tag: tags::MEDIA_STORAGE_SOP_INSTANCE_UID,
        })?,
        transfer_syntax_uid: transfer_syntax_uid.context(MissingAttributeSnafu {
            tag: tags::TRANSFER_SYNTAX_UID,
        })?,
    })
}

fn string_value(tag: Tag, value: Vec<u8>) -> Result<String> {
    let text = std::str::from_utf8(&value)
        .ok()
        .context(InvalidStringSnafu { tag })?;
    Ok(text
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
        .to_string())
}

#[cfg(test)]
pub(crate) fn build_file_meta(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax_uid: &str,
) -> Vec<u8> {
    fn element(out: &mut Vec<u8>, tag: Tag, vr: &[u8; 2], value: &[u8]) {
        let mut value = value.to_vec();
        if value.len() % 2 != 0 {
            value.push(0);
        }
        out.extend_from_slice(&tag.group().to_le_bytes());
        out.extend_from_slice(&tag.element().to_le_bytes());
        out.extend_from_slice(vr);
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(&value);
    }

    let mut group = Vec::new();
    element(
        &mut group,
        tags::MEDIA_STORAGE_SOP_CLASS_UID,
        b"UI",
        sop_class_uid.as_bytes(),
    );
    element(
        &mut group,
        tags::MEDIA_STORAGE_SOP_INSTANCE_UID,
        b"UI",
        sop_instance_uid.as_bytes(),
    );
    element(
        &mut group,
        tags::TRANSFER_SYNTAX_UID,
        b"UI",
        transfer_syntax_uid.as_bytes(),
    );

    let mut out = vec![0u8; 128];
    out.extend_from_slice(DICM_MAGIC);
    element(
        &mut out,
        tags::FILE_META_INFORMATION_GROUP_LENGTH,
        b"UL",
        &(group.len() as u32).to_le_bytes(),
    );
    out.extend_from_slice(&group);
    // a sliver of data set past the group boundary
    out.extend_from_slice(&[0x08, 0x00, 0x16, 0x00]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    #[test]
    fn parses_preambled_file_meta() {
        let data = build_file_meta(
            CT_IMAGE_STORAGE,
            "1.2.3.4.5",
            dicomnet_core::uids::EXPLICIT_VR_LITTLE_ENDIAN,
        );
        let meta = parse_file_meta(&data).unwrap();
        assert_eq!(meta.media_storage_sop_class_uid, CT_IMAGE_STORAGE);
        assert_eq!(meta.media_storage_sop_instance_uid, "1.2.3.4.5");
        assert_eq!(
            meta.transfer_syntax_uid,
            dicomnet_core::uids::EXPLICIT_VR_LITTLE_ENDIAN
        );
    }

    #[test]
    fn parses_file_meta_without_preamble() {
        let data = build_file_meta(CT_IMAGE_STORAGE, "1.2.3.4.5", "1.2.840.10008.1.2");
        let meta = parse_file_meta(&data[132..]).unwrap();
        assert_eq!(meta.media_storage_sop_instance_uid, "1.2.3.4.5");
    }

    #[test]
    fn rejects_payloads_without_file_meta() {
        assert!(matches!(parse_file_meta(b"PNG..."), Err(Error::NotDicom)));
        assert!(matches!(parse_file_meta(&[]), Err(Error::NotDicom)));
    }

    #[test]
    fn reports_missing_attributes() {
        // group with only the transfer syntax
        let mut out = vec![0u8; 128];
        out.extend_from_slice(DICM_MAGIC);
        out.extend_from_slice(&[0x02, 0x00, 0x10, 0x00]);
        out.extend_from_slice(b"UI");
        out.extend_from_slice(&18u16.to_le_bytes());
        out.extend_from_slice(b"1.2.840.10008.1.2\0");
        assert!(matches!(
            parse_file_meta(&out),
            Err(Error::MissingAttribute { tag }) if tag == tags::MEDIA_STORAGE_SOP_CLASS_UID
        ));
    }
}
