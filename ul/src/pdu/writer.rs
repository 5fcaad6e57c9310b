//! PDU writer module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write chunk `{}`", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(source(from(WriteChunkError, Box::from)))]
        source: Box<WriteChunkError>,
    },

    #[snafu(display("Field `{}` is not in the basic G0 repertoire", field))]
    EncodeField {
        field: &'static str,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        #[snafu(source(from(Error, Box::from)))]
        source: Box<Error>,
    },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Build the contents with the given closure,
/// then emit them preceded by their length as a big endian u32.
fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Build the contents with the given closure,
/// then emit them preceded by their length as a big endian u16.
fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Encode a text field for the wire:
/// the basic G0 repertoire only.
fn encode_text(text: &str, field: &'static str) -> Result<Vec<u8>> {
    if !text.is_ascii() {
        return EncodeFieldSnafu { field }.fail();
    }
    Ok(text.as_bytes().to_vec())
}

/// Write the two leading bytes shared by every PDU and item:
/// the type code and a reserved zero byte.
fn write_item_header(writer: &mut dyn Write, item_type: u8) -> Result<()> {
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })
}

/// Write a text-valued item or sub-item:
/// the item header, a u16 length, and the encoded characters.
///
/// Covers the application context item (0x10),
/// the abstract (0x30) and transfer (0x40) syntax sub-items,
/// and the implementation class UID (0x52)
/// and version name (0x55) user data sub-items,
/// which all share this frame.
fn write_text_item(
    writer: &mut dyn Write,
    item_type: u8,
    value: &str,
    field: &'static str,
) -> Result<()> {
    write_item_header(writer, item_type)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(&encode_text(value, field)?)
            .context(WriteFieldSnafu { field })
    })
    .context(WriteChunkSnafu { name: field })
}

/// Write an AE title field, space padded to 16 bytes.
fn write_ae_title(writer: &mut dyn Write, ae_title: &str, field: &'static str) -> Result<()> {
    let mut ae_title_bytes = encode_text(ae_title, field)?;
    ae_title_bytes.resize(16, b' ');
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

/// Write the fixed part shared by A-ASSOCIATE-RQ and -AC:
/// protocol version, reserved bytes and the two AE title fields.
fn write_associate_prefix(
    writer: &mut dyn Write,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;
    writer
        .write_u16::<BigEndian>(0x00)
        .context(WriteReservedSnafu { bytes: 2_u32 })?;
    write_ae_title(writer, called_ae_title, "Called-AE-title")?;
    write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;
    writer
        .write_all(&[0; 32])
        .context(WriteReservedSnafu { bytes: 32_u32 })
}

pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-RQ PDU Structure (PS3.8 §9.3.2)
            write_item_header(writer, 0x01)?;
            write_chunk_u32(writer, |writer| {
                write_associate_prefix(
                    writer,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                )?;

                write_text_item(
                    writer,
                    0x10,
                    application_context_name,
                    "Application-context-name",
                )?;

                for presentation_context in presentation_contexts {
                    write_presentation_context_proposed(writer, presentation_context)?;
                }

                write_user_variables(writer, user_variables)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;

            Ok(())
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            called_ae_title,
            calling_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-AC PDU Structure (PS3.8 §9.3.3);
            // the AE title fields are formally reserved here
            // and echo the values of the request
            write_item_header(writer, 0x02)?;
            write_chunk_u32(writer, |writer| {
                write_associate_prefix(
                    writer,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                )?;

                write_text_item(
                    writer,
                    0x10,
                    application_context_name,
                    "Application-context-name",
                )?;

                for presentation_context in presentation_contexts {
                    write_presentation_context_result(writer, presentation_context)?;
                }

                write_user_variables(writer, user_variables)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })?;

            Ok(())
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // A-ASSOCIATE-RJ PDU Structure (PS3.8 §9.3.4):
            // 1 reserved byte, result, source and reason
            write_item_header(writer, 0x03)?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                // result: 1 rejected-permanent, 2 rejected-transient
                writer
                    .write_u8(match result {
                        AssociationRJResult::Permanent => 0x01,
                        AssociationRJResult::Transient => 0x02,
                    })
                    .context(WriteFieldSnafu { field: "Result" })?;

                // source: 1 service-user, 2 provider (ACSE),
                // 3 provider (presentation);
                // the reason codes are scoped to the source
                let source_word: [u8; 2] = match source {
                    AssociationRJSource::ServiceUser(reason) => [
                        0x01,
                        match reason {
                            AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                                0x02
                            }
                            AssociationRJServiceUserReason::CallingAeTitleNotRecognized => 0x03,
                            AssociationRJServiceUserReason::CalledAeTitleNotRecognized => 0x07,
                            AssociationRJServiceUserReason::Reserved(data) => *data,
                        },
                    ],
                    AssociationRJSource::ServiceProviderAsce(reason) => [
                        0x02,
                        match reason {
                            AssociationRJServiceProviderAsceReason::NoReasonGiven => 0x01,
                            AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => {
                                0x02
                            }
                        },
                    ],
                    AssociationRJSource::ServiceProviderPresentation(reason) => [
                        0x03,
                        match reason {
                            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                0x01
                            }
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                                0x02
                            }
                            AssociationRJServiceProviderPresentationReason::Reserved(data) => *data,
                        },
                    ],
                };
                writer.extend(source_word);

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            // P-DATA-TF PDU Structure (PS3.8 §9.3.5)
            write_item_header(writer, 0x04)?;
            write_chunk_u32(writer, |writer| {
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        writer.push(presentation_data_value.presentation_context_id);

                        // message control header:
                        // bit 0 set for command fragments,
                        // bit 1 set on the last fragment
                        let mut message_header = 0x00;
                        if let PDataValueType::Command = presentation_data_value.value_type {
                            message_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_header |= 0x02;
                        }
                        writer.push(message_header);

                        writer.extend(&presentation_data_value.data);

                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }

                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })?;

            Ok(())
        }
        Pdu::ReleaseRQ => {
            // A-RELEASE-RQ PDU Structure (PS3.8 §9.3.6): 4 reserved bytes
            write_item_header(writer, 0x05)?;
            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RQ",
            })?;

            Ok(())
        }
        Pdu::ReleaseRP => {
            // A-RELEASE-RP PDU Structure (PS3.8 §9.3.7): 4 reserved bytes
            write_item_header(writer, 0x06)?;
            write_chunk_u32(writer, |writer| {
                writer.extend([0u8; 4]);
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RP",
            })?;

            Ok(())
        }
        Pdu::AbortRQ { source } => {
            // A-ABORT PDU Structure (PS3.8 §9.3.8):
            // 2 reserved bytes, then source and reason;
            // the reason is only significant for provider aborts
            write_item_header(writer, 0x07)?;
            write_chunk_u32(writer, |writer| {
                writer.push(0);
                writer.push(0);

                let source_word = match source {
                    AbortRQSource::ServiceUser => [0x00; 2],
                    AbortRQSource::Reserved => [0x01, 0x00],
                    AbortRQSource::ServiceProvider(reason) => match reason {
                        AbortRQServiceProviderReason::ReasonNotSpecified => [0x02, 0x00],
                        AbortRQServiceProviderReason::UnrecognizedPdu => [0x02, 0x01],
                        AbortRQServiceProviderReason::UnexpectedPdu => [0x02, 0x02],
                        AbortRQServiceProviderReason::Reserved => [0x02, 0x03],
                        AbortRQServiceProviderReason::UnrecognizedPduParameter => [0x02, 0x04],
                        AbortRQServiceProviderReason::UnexpectedPduParameter => [0x02, 0x05],
                        AbortRQServiceProviderReason::InvalidPduParameter => [0x02, 0x06],
                    },
                };
                writer.extend(source_word);

                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })?;

            Ok(())
        }
        Pdu::Unknown { pdu_type, data } => {
            write_item_header(writer, *pdu_type)?;
            write_chunk_u32(writer, |writer| {
                writer.extend(data);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Unknown" })?;

            Ok(())
        }
    }
}

/// Presentation Context Item, proposed (type 20H):
/// the context id, 3 reserved bytes,
/// one abstract syntax sub-item
/// and the transfer syntax sub-items in order of preference.
fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    write_item_header(writer, 0x20)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_all(&[0x00; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        write_text_item(
            writer,
            0x30,
            &presentation_context.abstract_syntax,
            "Abstract-syntax-name",
        )?;

        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_text_item(writer, 0x40, transfer_syntax, "Transfer-syntax-name")?;
        }

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;

    Ok(())
}

/// Presentation Context Item, result (type 21H):
/// the context id, the result/reason code
/// and exactly one transfer syntax sub-item,
/// which is not significant unless the result is acceptance.
fn write_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    write_item_header(writer, 0x21)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // result/reason: 0 acceptance, 1 user rejection,
        // 2 no reason, 3 abstract syntax not supported,
        // 4 transfer syntaxes not supported
        writer
            .write_u8(presentation_context.reason as u8)
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        write_text_item(
            writer,
            0x40,
            &presentation_context.transfer_syntax,
            "Transfer-syntax-name",
        )?;

        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;

    Ok(())
}

/// User Information Item (type 50H) with its user data sub-items.
fn write_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item_header(writer, 0x50)?;
    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    // the largest P-DATA-TF PDU the sender of this item
                    // is willing to receive; 0 means no maximum
                    write_item_header(writer, 0x51)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum-length-received",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(implementation_class_uid) => {
                    write_text_item(
                        writer,
                        0x52,
                        implementation_class_uid,
                        "Implementation-class-uid",
                    )?;
                }
                UserVariableItem::ImplementationVersionName(implementation_version_name) => {
                    write_text_item(
                        writer,
                        0x55,
                        implementation_version_name,
                        "Implementation-version-name",
                    )?;
                }
                UserVariableItem::AsyncOperationsWindow {
                    max_operations_invoked,
                    max_operations_performed,
                } => {
                    write_item_header(writer, 0x53)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(*max_operations_invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*max_operations_performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Asynchronous Operations Window",
                    })?;
                }
                UserVariableItem::RoleSelection {
                    sop_class_uid,
                    scu_role,
                    scp_role,
                } => {
                    write_item_header(writer, 0x54)?;
                    write_chunk_u16(writer, |writer| {
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&encode_text(sop_class_uid, "SOP-class-uid")?)
                                .context(WriteFieldSnafu {
                                    field: "SOP-class-uid",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;
                        writer
                            .write_u8(u8::from(*scu_role))
                            .context(WriteFieldSnafu { field: "SCU-role" })?;
                        writer
                            .write_u8(u8::from(*scp_role))
                            .context(WriteFieldSnafu { field: "SCP-role" })
                    })
                    .context(WriteChunkSnafu {
                        name: "SCP/SCU Role Selection",
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    write_item_header(writer, 0x58)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u8(user_identity.identity_type().to_u8())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;
                        writer
                            .write_u8(u8::from(user_identity.positive_response_requested()))
                            .context(WriteFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;

                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.primary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-primary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-primary-field",
                        })?;

                        // only non-empty for username and password identities
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.secondary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-secondary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-secondary-field",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "User Identity Item",
                    })?;
                }
                UserVariableItem::UserIdentityResponse(response) => {
                    write_item_header(writer, 0x59)?;
                    write_chunk_u16(writer, |writer| {
                        write_chunk_u16(writer, |writer| {
                            writer.write_all(response).context(WriteFieldSnafu {
                                field: "User-Identity-server-response",
                            })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-server-response",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "User Identity Response Item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_item_header(writer, *item_type)?;
                    write_chunk_u16(writer, |writer| {
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Unknown user data",
                        })
                    })
                    .context(WriteChunkSnafu { name: "Unknown" })?;
                }
            }
        }

        Ok(())
    })
    .context(WriteChunkSnafu { name: "User-data" })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_write_chunks_with_preceding_u32_length() {
        let mut bytes = vec![0u8; 0];
        write_chunk_u32(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .unwrap();

        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);
    }

    #[test]
    fn can_write_chunks_with_preceding_u16_length() {
        let mut bytes = vec![0u8; 0];
        write_chunk_u16(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .unwrap();

        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);
    }

    #[test]
    fn text_items_carry_their_length() {
        let mut bytes = vec![0u8; 0];
        write_text_item(&mut bytes, 0x30, "1.2.840.10008.1.1", "Abstract-syntax-name")
            .unwrap();
        assert_eq!(bytes[0], 0x30);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 17);
        assert_eq!(&bytes[4..], b"1.2.840.10008.1.1");
    }

    #[test]
    fn write_abort_rq() {
        let mut out = vec![];

        // abort by request of the service user
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        write_pdu(&mut out, &pdu).unwrap();
        assert_eq!(
            &out,
            &[
                // code 7 + reserved byte
                0x07, 0x00, //
                // PDU length: 4 bytes
                0x00, 0x00, 0x00, 0x04, //
                // reserved 2 bytes + source: service user (0) + reason (0)
                0x00, 0x00, 0x00, 0x00,
            ]
        );
        out.clear();

        // abort by request of the service provider
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            ),
        };
        write_pdu(&mut out, &pdu).unwrap();
        assert_eq!(
            &out,
            &[
                // code 7 + reserved byte
                0x07, 0x00, //
                // PDU length: 4 bytes
                0x00, 0x00, 0x00, 0x04, //
                // reserved 2 bytes
                0x00, 0x00, //
                // source: service provider (2), invalid parameter value (6)
                0x02, 0x06,
            ]
        );
    }
}
