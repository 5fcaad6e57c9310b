//! DIMSE message types and command set builders.

use dicomnet_core::tag::tags;
use dicomnet_core::VR;
use dicomnet_ul::command::{CommandSet, NO_DATA_SET};
use dicomnet_ul::pdata::AssembledMessage;
use snafu::Snafu;

/// The value of (0000,0800) Command Data Set Type
/// which indicates that a data set follows the command.
const DATA_SET_PRESENT: u16 = 0x0000;

/// The command field codes of the DIMSE messages this stack handles.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(CommandField::CStoreRq),
            0x8001 => Some(CommandField::CStoreRsp),
            0x0010 => Some(CommandField::CGetRq),
            0x8010 => Some(CommandField::CGetRsp),
            0x0020 => Some(CommandField::CFindRq),
            0x8020 => Some(CommandField::CFindRsp),
            0x0021 => Some(CommandField::CMoveRq),
            0x8021 => Some(CommandField::CMoveRsp),
            0x0030 => Some(CommandField::CEchoRq),
            0x8030 => Some(CommandField::CEchoRsp),
            0x0100 => Some(CommandField::NEventReportRq),
            0x8100 => Some(CommandField::NEventReportRsp),
            0x0130 => Some(CommandField::NActionRq),
            0x8130 => Some(CommandField::NActionRsp),
            0x0FFF => Some(CommandField::CCancelRq),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// The priority of a composite service request.
#[repr(u16)]
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Priority {
    #[default]
    Medium = 0x0000,
    High = 0x0001,
    Low = 0x0002,
}

/// Classification of a DIMSE status code.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Success,
    Warning,
    Failure,
    Cancel,
    Pending,
}

impl StatusClass {
    /// Classify the given status code,
    /// or `None` if the code is outside the known ranges.
    pub fn of(status: u16) -> Option<Self> {
        match status {
            0x0000 => Some(StatusClass::Success),
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Some(StatusClass::Warning),
            0x0100..=0x01FF | 0x0200..=0x02FF | 0xA000..=0xAFFF | 0xC000..=0xCFFF => {
                Some(StatusClass::Failure)
            }
            0xFE00 => Some(StatusClass::Cancel),
            0xFF00 | 0xFF01 => Some(StatusClass::Pending),
            _ => None,
        }
    }
}

/// The sub-operation counters of a C-MOVE or C-GET response.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubOperations {
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warnings: Option<u16>,
}

impl SubOperations {
    pub fn from_command(command: &CommandSet) -> Self {
        SubOperations {
            remaining: command.number_of_remaining_sub_operations().ok(),
            completed: command.number_of_completed_sub_operations().ok(),
            failed: command.number_of_failed_sub_operations().ok(),
            warnings: command.number_of_warning_sub_operations().ok(),
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ClassifyError {
    /// the command set carries no command field
    MissingCommandField {
        source: dicomnet_ul::command::Error,
    },

    #[snafu(display("unknown command field 0x{:04X}", code))]
    UnknownCommandField { code: u16 },
}

/// A DIMSE message classified by its command field.
///
/// Consumers match on the variant
/// instead of downcasting an assembled message.
#[derive(Debug, Clone, PartialEq)]
pub enum DimseMessage {
    CEchoRq(AssembledMessage),
    CEchoRsp(AssembledMessage),
    CStoreRq(AssembledMessage),
    CStoreRsp(AssembledMessage),
    CFindRq(AssembledMessage),
    CFindRsp(AssembledMessage),
    CMoveRq(AssembledMessage),
    CMoveRsp(AssembledMessage),
    CGetRq(AssembledMessage),
    CGetRsp(AssembledMessage),
    CCancelRq(AssembledMessage),
    NActionRq(AssembledMessage),
    NActionRsp(AssembledMessage),
    NEventReportRq(AssembledMessage),
    NEventReportRsp(AssembledMessage),
}

impl DimseMessage {
    /// Classify an assembled message by its command field.
    pub fn classify(message: AssembledMessage) -> Result<Self, ClassifyError> {
        let code = message
            .command
            .command_field()
            .map_err(|source| ClassifyError::MissingCommandField { source })?;
        let field =
            CommandField::from_code(code).ok_or(ClassifyError::UnknownCommandField { code })?;
        Ok(match field {
            CommandField::CEchoRq => DimseMessage::CEchoRq(message),
            CommandField::CEchoRsp => DimseMessage::CEchoRsp(message),
            CommandField::CStoreRq => DimseMessage::CStoreRq(message),
            CommandField::CStoreRsp => DimseMessage::CStoreRsp(message),
            CommandField::CFindRq => DimseMessage::CFindRq(message),
            CommandField::CFindRsp => DimseMessage::CFindRsp(message),
            CommandField::CMoveRq => DimseMessage::CMoveRq(message),
            CommandField::CMoveRsp => DimseMessage::CMoveRsp(message),
            CommandField::CGetRq => DimseMessage::CGetRq(message),
            CommandField::CGetRsp => DimseMessage::CGetRsp(message),
            CommandField::CCancelRq => DimseMessage::CCancelRq(message),
            CommandField::NActionRq => DimseMessage::NActionRq(message),
            CommandField::NActionRsp => DimseMessage::NActionRsp(message),
            CommandField::NEventReportRq => DimseMessage::NEventReportRq(message),
            CommandField::NEventReportRsp => DimseMessage::NEventReportRsp(message),
        })
    }

    /// The command field of the message.
    pub fn command_field(&self) -> CommandField {
        match self {
            DimseMessage::CEchoRq(_) => CommandField::CEchoRq,
            DimseMessage::CEchoRsp(_) => CommandField::CEchoRsp,
            DimseMessage::CStoreRq(_) => CommandField::CStoreRq,
            DimseMessage::CStoreRsp(_) => CommandField::CStoreRsp,
            DimseMessage::CFindRq(_) => CommandField::CFindRq,
            DimseMessage::CFindRsp(_) => CommandField::CFindRsp,
            DimseMessage::CMoveRq(_) => CommandField::CMoveRq,
            DimseMessage::CMoveRsp(_) => CommandField::CMoveRsp,
            DimseMessage::CGetRq(_) => CommandField::CGetRq,
            DimseMessage::CGetRsp(_) => CommandField::CGetRsp,
            DimseMessage::CCancelRq(_) => CommandField::CCancelRq,
            DimseMessage::NActionRq(_) => CommandField::NActionRq,
            DimseMessage::NActionRsp(_) => CommandField::NActionRsp,
            DimseMessage::NEventReportRq(_) => CommandField::NEventReportRq,
            DimseMessage::NEventReportRsp(_) => CommandField::NEventReportRsp,
        }
    }

    /// The underlying assembled message.
    pub fn inner(&self) -> &AssembledMessage {
        match self {
            DimseMessage::CEchoRq(m)
            | DimseMessage::CEchoRsp(m)
            | DimseMessage::CStoreRq(m)
            | DimseMessage::CStoreRsp(m)
            | DimseMessage::CFindRq(m)
            | DimseMessage::CFindRsp(m)
            | DimseMessage::CMoveRq(m)
            | DimseMessage::CMoveRsp(m)
            | DimseMessage::CGetRq(m)
            | DimseMessage::CGetRsp(m)
            | DimseMessage::CCancelRq(m)
            | DimseMessage::NActionRq(m)
            | DimseMessage::NActionRsp(m)
            | DimseMessage::NEventReportRq(m)
            | DimseMessage::NEventReportRsp(m) => m,
        }
    }

    /// Consume the classification,
    /// returning the underlying assembled message.
    pub fn into_inner(self) -> AssembledMessage {
        match self {
            DimseMessage::CEchoRq(m)
            | DimseMessage::CEchoRsp(m)
            | DimseMessage::CStoreRq(m)
            | DimseMessage::CStoreRsp(m)
            | DimseMessage::CFindRq(m)
            | DimseMessage::CFindRsp(m)
            | DimseMessage::CMoveRq(m)
            | DimseMessage::CMoveRsp(m)
            | DimseMessage::CGetRq(m)
            | DimseMessage::CGetRsp(m)
            | DimseMessage::CCancelRq(m)
            | DimseMessage::NActionRq(m)
            | DimseMessage::NActionRsp(m)
            | DimseMessage::NEventReportRq(m)
            | DimseMessage::NEventReportRsp(m) => m,
        }
    }

    pub fn presentation_context_id(&self) -> u8 {
        self.inner().presentation_context_id
    }

    pub fn command(&self) -> &CommandSet {
        &self.inner().command
    }

    pub fn has_data_set(&self) -> bool {
        self.inner().command.has_data_set()
    }

    pub fn message_id(&self) -> Option<u16> {
        self.command().message_id().ok()
    }

    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        self.command().message_id_being_responded_to().ok()
    }

    pub fn status(&self) -> Option<u16> {
        self.command().status().ok()
    }
}

// request command set builders

/// Build a C-ECHO-RQ command set.
pub fn echo_rq(message_id: u16) -> CommandSet {
    let mut cmd = CommandSet::new();
    cmd.put_str(
        tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        dicomnet_core::uids::VERIFICATION,
    );
    cmd.put_u16(tags::COMMAND_FIELD, CommandField::CEchoRq.code());
    cmd.put_u16(tags::MESSAGE_ID, message_id);
    cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET);
    cmd
}

/// Build a C-STORE-RQ command set.
///
/// `move_originator` carries the AE title and message id
/// of the C-MOVE operation this store is a sub-operation of.
pub fn store_rq(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    priority: Priority,
    move_originator: Option<(&str, u16)>,
) -> CommandSet {
    let mut cmd = CommandSet::new();
    cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, VR::UI, sop_class_uid);
    cmd.put_u16(tags::COMMAND_FIELD, CommandField::CStoreRq.code());
    cmd.put_u16(tags::MESSAGE_ID, message_id);
    cmd.put_u16(tags::PRIORITY, priority as u16);
    cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
    cmd.put_str(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
    if let Some((originator_ae, originator_id)) = move_originator {
        cmd.put_str(
            tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
            VR::AE,
            originator_ae,
        );
        cmd.put_u16(tags::MOVE_ORIGINATOR_MESSAGE_ID, originator_id);
    }
    cmd
}

/// Build a C-STORE-RSP command set,
/// as sent for the sub-operations of a C-GET.
pub fn store_rsp(
    message_id_being_responded_to: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> CommandSet {
    let mut cmd = CommandSet::new();
    cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, VR::UI, sop_class_uid);
    cmd.put_u16(tags::COMMAND_FIELD, CommandField::CStoreRsp.code());
    cmd.put_u16(
        tags::MESSAGE_ID_BEING_RESPONDED_TO,
        message_id_being_responded_to,
    );
    cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET);
    cmd.put_u16(tags::STATUS, status);
    cmd.put_str(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
    cmd
}

/// Build a C-FIND-RQ command set;
/// the query identifier travels as the data set.
pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> CommandSet {
    let mut cmd = CommandSet::new();
    cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, VR::UI, sop_class_uid);
    cmd.put_u16(tags::COMMAND_FIELD, CommandField::CFindRq.code());
    cmd.put_u16(tags::MESSAGE_ID, message_id);
    cmd.put_u16(tags::PRIORITY, priority as u16);
    cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
    cmd
}

/// Build a C-MOVE-RQ command set;
/// sub-operations are directed at the destination AE.
pub fn move_rq(
    message_id: u16,
    sop_class_uid: &str,
    destination_ae: &str,
    priority: Priority,
) -> CommandSet {
    let mut cmd = CommandSet::new();
    cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, VR::UI, sop_class_uid);
    cmd.put_u16(tags::COMMAND_FIELD, CommandField::CMoveRq.code());
    cmd.put_u16(tags::MESSAGE_ID, message_id);
    cmd.put_str(tags::MOVE_DESTINATION, VR::AE, destination_ae);
    cmd.put_u16(tags::PRIORITY, priority as u16);
    cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
    cmd
}

/// Build a C-GET-RQ command set.
pub fn get_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> CommandSet {
    let mut cmd = CommandSet::new();
    cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, VR::UI, sop_class_uid);
    cmd.put_u16(tags::COMMAND_FIELD, CommandField::CGetRq.code());
    cmd.put_u16(tags::MESSAGE_ID, message_id);
    cmd.put_u16(tags::PRIORITY, priority as u16);
    cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
    cmd
}

/// Build a C-CANCEL-RQ command set
/// for the outstanding operation with the given message id.
pub fn cancel_rq(message_id_being_cancelled: u16) -> CommandSet {
    let mut cmd = CommandSet::new();
    cmd.put_u16(tags::COMMAND_FIELD, CommandField::CCancelRq.code());
    cmd.put_u16(
        tags::MESSAGE_ID_BEING_RESPONDED_TO,
        message_id_being_cancelled,
    );
    cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x0000, StatusClass::Success)]
    #[case(0xB000, StatusClass::Warning)]
    #[case(0xB006, StatusClass::Warning)]
    #[case(0xB007, StatusClass::Warning)]
    #[case(0xA700, StatusClass::Failure)]
    #[case(0xC001, StatusClass::Failure)]
    #[case(0x0122, StatusClass::Failure)]
    #[case(0xFE00, StatusClass::Cancel)]
    #[case(0xFF00, StatusClass::Pending)]
    #[case(0xFF01, StatusClass::Pending)]
    fn status_classification(#[case] status: u16, #[case] expected: StatusClass) {
        assert_eq!(StatusClass::of(status), Some(expected));
    }

    #[test]
    fn unknown_status_is_unclassified() {
        assert_eq!(StatusClass::of(0x1234), None);
    }

    #[test]
    fn command_field_round_trip() {
        for field in [
            CommandField::CStoreRq,
            CommandField::CFindRsp,
            CommandField::CEchoRq,
            CommandField::CCancelRq,
            CommandField::NEventReportRsp,
        ] {
            assert_eq!(CommandField::from_code(field.code()), Some(field));
        }
        assert_eq!(CommandField::from_code(0x4242), None);
    }

    #[test]
    fn classify_echo_response() {
        let mut command = echo_rq(9);
        command.put_u16(tags::COMMAND_FIELD, CommandField::CEchoRsp.code());
        command.put_u16(tags::STATUS, 0x0000);
        let message = AssembledMessage {
            presentation_context_id: 1,
            command,
            data: None,
        };
        let message = DimseMessage::classify(message).unwrap();
        assert!(matches!(message, DimseMessage::CEchoRsp(_)));
        assert_eq!(message.status(), Some(0x0000));
        assert!(!message.has_data_set());
    }

    #[test]
    fn store_rq_declares_data_set() {
        let cmd = store_rq(
            3,
            "1.2.840.10008.5.1.4.1.1.2",
            "1.2.3.4.5",
            Priority::Medium,
            Some(("MOVE-SCU", 7)),
        );
        assert!(cmd.has_data_set());
        assert_eq!(cmd.affected_sop_instance_uid().unwrap(), "1.2.3.4.5");
        assert_eq!(
            cmd.get_str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
                .unwrap(),
            "MOVE-SCU"
        );
    }

    #[test]
    fn cancel_rq_has_no_data_set() {
        let cmd = cancel_rq(11);
        assert!(!cmd.has_data_set());
        assert_eq!(cmd.message_id_being_responded_to().unwrap(), 11);
    }
}
