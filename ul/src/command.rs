//! DIMSE command set codec.
//!
//! Command sets are the group 0000 data sets
//! exchanged in the command fragments of P-DATA-TF PDUs.
//! They are always encoded in Implicit VR Little Endian,
//! regardless of the transfer syntax negotiated
//! for the presentation context.

use std::collections::BTreeMap;

use byteordered::byteorder::{LittleEndian, ReadBytesExt};
use dicomnet_core::tag::tags;
use dicomnet_core::{Tag, VR};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::io::Read;

/// The value of (0000,0800) Command Data Set Type
/// which indicates that no data set is present.
pub const NO_DATA_SET: u16 = 0x0101;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not read command element header"))]
    ReadHeader { source: std::io::Error },

    #[snafu(display("Could not read value of command element {}", tag))]
    ReadValue {
        tag: Tag,
        source: std::io::Error,
    },

    #[snafu(display("Unexpected element {} in command set", tag))]
    NotCommandGroup { tag: Tag },

    #[snafu(display("Missing command element {}", tag))]
    MissingField { tag: Tag },

    #[snafu(display("Command element {} has length {}, expected {}", tag, length, expected))]
    UnexpectedLength {
        tag: Tag,
        length: usize,
        expected: usize,
    },

    #[snafu(display("Command element {} is not a character string", tag))]
    InvalidString { tag: Tag },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DIMSE command set:
/// the attributes of group 0000 keyed by tag,
/// in ascending tag order.
///
/// The group length element (0000,0000) is implicit:
/// it is recomputed on encoding
/// and never stored on decoding.
///
/// Command sets are plain values.
/// Cloning one yields an independent copy;
/// there is no shared mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSet {
    elements: BTreeMap<Tag, Vec<u8>>,
}

impl CommandSet {
    /// Create an empty command set.
    pub fn new() -> Self {
        CommandSet::default()
    }

    /// Decode a command set from Implicit VR Little Endian bytes.
    ///
    /// A group length element, if present, is used only
    /// to delimit the input and is not retained.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let mut elements = BTreeMap::new();
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
            let element = cursor.read_u16::<LittleEndian>().context(ReadHeaderSnafu)?;
            let length = cursor.read_u32::<LittleEndian>().context(ReadHeaderSnafu)?;
            let tag = Tag(group, element);
            ensure!(tag.is_command(), NotCommandGroupSnafu { tag });

            let mut value = vec![0; length as usize];
            cursor
                .read_exact(&mut value)
                .context(ReadValueSnafu { tag })?;

            if tag == tags::COMMAND_GROUP_LENGTH {
                // trust the group length only for delimiting the input
                if value.len() == 4 {
                    let declared = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
                    limit = Some(cursor.position() + u64::from(declared));
                }
                continue;
            }

            elements.insert(tag, value);
        }

        Ok(CommandSet { elements })
    }

    /// Encode the command set in Implicit VR Little Endian,
    /// with a freshly computed group length element first.
    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self
            .elements
            .values()
            .map(|value| 8 + value.len())
            .sum();

        let mut out = Vec::with_capacity(12 + body_len);
        // (0000,0000) Command Group Length
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&(body_len as u32).to_le_bytes());

        for (tag, value) in &self.elements {
            out.extend_from_slice(&tag.group().to_le_bytes());
            out.extend_from_slice(&tag.element().to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }

        out
    }

    /// Whether the command set declares an accompanying data set,
    /// i.e. (0000,0800) is present with a value other than 0x0101.
    pub fn has_data_set(&self) -> bool {
        match self.get_u16(tags::COMMAND_DATA_SET_TYPE) {
            Ok(value) => value != NO_DATA_SET,
            Err(_) => false,
        }
    }

    // raw element access

    pub fn get(&self, tag: Tag) -> Option<&[u8]> {
        self.elements.get(&tag).map(Vec::as_slice)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over the elements in ascending tag order.
    pub fn iter(&self) -> impl Iterator<Item = (Tag, &[u8])> {
        self.elements.iter().map(|(tag, value)| (*tag, value.as_slice()))
    }

    // typed getters

    pub fn get_u16(&self, tag: Tag) -> Result<u16> {
        let value = self.get(tag).context(MissingFieldSnafu { tag })?;
        ensure!(
            value.len() == 2,
            UnexpectedLengthSnafu {
                tag,
                length: value.len(),
                expected: 2_usize
            }
        );
        Ok(u16::from_le_bytes([value[0], value[1]]))
    }

    pub fn get_str(&self, tag: Tag) -> Result<&str> {
        let value = self.get(tag).context(MissingFieldSnafu { tag })?;
        let text = std::str::from_utf8(value).ok().context(InvalidStringSnafu { tag })?;
        Ok(text.trim_end_matches(|c: char| c == ' ' || c == '\0'))
    }

    // typed setters

    pub fn put_u16(&mut self, tag: Tag, value: u16) {
        self.elements.insert(tag, value.to_le_bytes().to_vec());
    }

    /// Insert a string value,
    /// padded to even length with the byte of the given VR.
    pub fn put_str(&mut self, tag: Tag, vr: VR, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() % 2 != 0 {
            bytes.push(vr.padding_byte());
        }
        self.elements.insert(tag, bytes);
    }

    // field accessors

    pub fn command_field(&self) -> Result<u16> {
        self.get_u16(tags::COMMAND_FIELD)
    }

    pub fn message_id(&self) -> Result<u16> {
        self.get_u16(tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.get_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn status(&self) -> Result<u16> {
        self.get_u16(tags::STATUS)
    }

    pub fn priority(&self) -> Result<u16> {
        self.get_u16(tags::PRIORITY)
    }

    pub fn affected_sop_class_uid(&self) -> Result<&str> {
        self.get_str(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn requested_sop_class_uid(&self) -> Result<&str> {
        self.get_str(tags::REQUESTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Result<&str> {
        self.get_str(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn requested_sop_instance_uid(&self) -> Result<&str> {
        self.get_str(tags::REQUESTED_SOP_INSTANCE_UID)
    }

    pub fn move_destination(&self) -> Result<&str> {
        self.get_str(tags::MOVE_DESTINATION)
    }

    pub fn event_type_id(&self) -> Result<u16> {
        self.get_u16(tags::EVENT_TYPE_ID)
    }

    pub fn action_type_id(&self) -> Result<u16> {
        self.get_u16(tags::ACTION_TYPE_ID)
    }

    pub fn number_of_remaining_sub_operations(&self) -> Result<u16> {
        self.get_u16(tags::NUMBER_OF_REMAINING_SUB_OPERATIONS)
    }

    pub fn number_of_completed_sub_operations(&self) -> Result<u16> {
        self.get_u16(tags::NUMBER_OF_COMPLETED_SUB_OPERATIONS)
    }

    pub fn number_of_failed_sub_operations(&self) -> Result<u16> {
        self.get_u16(tags::NUMBER_OF_FAILED_SUB_OPERATIONS)
    }

    pub fn number_of_warning_sub_operations(&self) -> Result<u16> {
        self.get_u16(tags::NUMBER_OF_WARNING_SUB_OPERATIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicomnet_core::tag::tags;
    use dicomnet_core::VR;

    fn c_echo_rq(message_id: u16) -> CommandSet {
        let mut cmd = CommandSet::new();
        cmd.put_str(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            "1.2.840.10008.1.1",
        );
        cmd.put_u16(tags::COMMAND_FIELD, 0x0030);
        cmd.put_u16(tags::MESSAGE_ID, message_id);
        cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET);
        cmd
    }

    #[test]
    fn encode_decode_round_trip() {
        let cmd = c_echo_rq(1);
        let encoded = cmd.encode();
        let decoded = CommandSet::decode(&encoded).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn group_length_is_recomputed_and_first() {
        let cmd = c_echo_rq(5);
        let encoded = cmd.encode();
        // element (0000,0000), length 4
        assert_eq!(&encoded[0..8], &[0, 0, 0, 0, 4, 0, 0, 0]);
        let declared = u32::from_le_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]);
        assert_eq!(declared as usize, encoded.len() - 12);
    }

    #[test]
    fn uid_values_are_null_padded_to_even_length() {
        let cmd = c_echo_rq(1);
        // 17 characters, padded to 18 with NUL
        let value = cmd.get(tags::AFFECTED_SOP_CLASS_UID).unwrap();
        assert_eq!(value.len(), 18);
        assert_eq!(value[17], 0);
        // and the accessor strips the padding again
        assert_eq!(cmd.affected_sop_class_uid().unwrap(), "1.2.840.10008.1.1");
    }

    #[test]
    fn has_data_set_tracks_data_set_type() {
        let mut cmd = c_echo_rq(1);
        assert!(!cmd.has_data_set());
        cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, 0x0000);
        assert!(cmd.has_data_set());
    }

    #[test]
    fn decode_rejects_foreign_groups() {
        let mut data = vec![];
        data.extend_from_slice(&[0x08, 0x00, 0x16, 0x00]);
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(b"1\0");
        assert!(matches!(
            CommandSet::decode(&data),
            Err(Error::NotCommandGroup { tag }) if tag == Tag(0x0008, 0x0016)
        ));
    }

    #[test]
    fn typed_accessors() {
        let cmd = c_echo_rq(42);
        assert_eq!(cmd.command_field().unwrap(), 0x0030);
        assert_eq!(cmd.message_id().unwrap(), 42);
        assert!(matches!(
            cmd.status(),
            Err(Error::MissingField { tag }) if tag == tags::STATUS
        ));
    }
}
