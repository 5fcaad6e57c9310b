//! DICOM attribute tags.

use std::fmt;

/// Idiomatic alias for a tag's group number.
pub type GroupNumber = u16;
/// Idiomatic alias for a tag's element number.
pub type ElementNumber = u16;

/// The data type for DICOM data element tags.
///
/// Tags are ordered by group number, then by element number.
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy)]
pub struct Tag(pub GroupNumber, pub ElementNumber);

impl Tag {
    /// Getter for the tag's group value.
    #[inline]
    pub fn group(self) -> GroupNumber {
        self.0
    }

    /// Getter for the tag's element value.
    #[inline]
    pub fn element(self) -> ElementNumber {
        self.1
    }

    /// Whether this tag belongs to the command group (0000,xxxx).
    #[inline]
    pub fn is_command(self) -> bool {
        self.0 == 0x0000
    }

    /// Whether this tag belongs to the file meta group (0002,xxxx).
    #[inline]
    pub fn is_file_meta(self) -> bool {
        self.0 == 0x0002
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Tag(0x{:04X}, 0x{:04X})", self.0, self.1)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

impl From<(u16, u16)> for Tag {
    #[inline]
    fn from((g, e): (u16, u16)) -> Tag {
        Tag(g, e)
    }
}

/// Command set (group 0000) and routed data set tags.
pub mod tags {
    use super::Tag;

    // group 0000: command set

    /// Command Group Length
    pub const COMMAND_GROUP_LENGTH: Tag = Tag(0x0000, 0x0000);
    /// Affected SOP Class UID
    pub const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
    /// Requested SOP Class UID
    pub const REQUESTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0003);
    /// Command Field
    pub const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
    /// Message ID
    pub const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
    /// Message ID Being Responded To
    pub const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
    /// Move Destination
    pub const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
    /// Priority
    pub const PRIORITY: Tag = Tag(0x0000, 0x0700);
    /// Command Data Set Type
    pub const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
    /// Status
    pub const STATUS: Tag = Tag(0x0000, 0x0900);
    /// Affected SOP Instance UID
    pub const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
    /// Requested SOP Instance UID
    pub const REQUESTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1001);
    /// Event Type ID
    pub const EVENT_TYPE_ID: Tag = Tag(0x0000, 0x1002);
    /// Action Type ID
    pub const ACTION_TYPE_ID: Tag = Tag(0x0000, 0x1008);
    /// Number of Remaining Sub-operations
    pub const NUMBER_OF_REMAINING_SUB_OPERATIONS: Tag = Tag(0x0000, 0x1020);
    /// Number of Completed Sub-operations
    pub const NUMBER_OF_COMPLETED_SUB_OPERATIONS: Tag = Tag(0x0000, 0x1021);
    /// Number of Failed Sub-operations
    pub const NUMBER_OF_FAILED_SUB_OPERATIONS: Tag = Tag(0x0000, 0x1022);
    /// Number of Warning Sub-operations
    pub const NUMBER_OF_WARNING_SUB_OPERATIONS: Tag = Tag(0x0000, 0x1023);
    /// Move Originator Application Entity Title
    pub const MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE: Tag = Tag(0x0000, 0x1030);
    /// Move Originator Message ID
    pub const MOVE_ORIGINATOR_MESSAGE_ID: Tag = Tag(0x0000, 0x1031);

    // group 0002: file meta information

    /// File Meta Information Group Length
    pub const FILE_META_INFORMATION_GROUP_LENGTH: Tag = Tag(0x0002, 0x0000);
    /// Media Storage SOP Class UID
    pub const MEDIA_STORAGE_SOP_CLASS_UID: Tag = Tag(0x0002, 0x0002);
    /// Media Storage SOP Instance UID
    pub const MEDIA_STORAGE_SOP_INSTANCE_UID: Tag = Tag(0x0002, 0x0003);
    /// Transfer Syntax UID
    pub const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);
    /// Implementation Class UID
    pub const IMPLEMENTATION_CLASS_UID: Tag = Tag(0x0002, 0x0012);

    // routed data set attributes

    /// Query/Retrieve Level
    pub const QUERY_RETRIEVE_LEVEL: Tag = Tag(0x0008, 0x0052);
    /// SOP Class UID
    pub const SOP_CLASS_UID: Tag = Tag(0x0008, 0x0016);
    /// SOP Instance UID
    pub const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_ordering_is_group_then_element() {
        let mut v = vec![
            Tag(0x0010, 0x0010),
            Tag(0x0008, 0x0052),
            Tag(0x0008, 0x0018),
            Tag(0x0000, 0x0100),
        ];
        v.sort();
        assert_eq!(
            v,
            vec![
                Tag(0x0000, 0x0100),
                Tag(0x0008, 0x0018),
                Tag(0x0008, 0x0052),
                Tag(0x0010, 0x0010),
            ]
        );
    }

    #[test]
    fn tag_display() {
        assert_eq!(Tag(0x0008, 0x0052).to_string(), "(0008,0052)");
        assert_eq!(format!("{:?}", Tag(0x0000, 0x0900)), "Tag(0x0000, 0x0900)");
    }

    #[test]
    fn tag_group_predicates() {
        assert!(tags::COMMAND_FIELD.is_command());
        assert!(!tags::QUERY_RETRIEVE_LEVEL.is_command());
        assert!(tags::TRANSFER_SYNTAX_UID.is_file_meta());
    }
}
