//! Reassembly and fragmentation of DIMSE messages.
//!
//! A DIMSE message travels as a sequence of presentation data values:
//! one or more command fragments,
//! followed by zero or more data set fragments.
//! The [`MessageAssembler`] turns incoming fragments back into
//! whole messages,
//! and [`fragment_message`] splits an outbound message
//! into P-DATA-TF PDUs which respect the negotiated maximum PDU size.

use snafu::{ensure, ResultExt, Snafu};

use crate::command::CommandSet;
use crate::pdu::{PDataValue, PDataValueType, Pdu, PDU_HEADER_SIZE};

/// The bytes of overhead between a PDU and the payload of its
/// single presentation data value:
/// the PDU header (6 bytes), the PDV item length (4 bytes),
/// the presentation context id and the message control header.
pub const PDV_OVERHEAD: u32 = PDU_HEADER_SIZE + 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "Presentation context id mismatch within message: expected {}, got {}",
        expected,
        got
    ))]
    ContextIdMismatch { expected: u8, got: u8 },

    /// received a command fragment after the command set was complete
    CommandAlreadyComplete,

    /// received a data set fragment after the data set was complete
    DataSetAlreadyComplete,

    /// received data set fragments for a command which declares no data set
    UnexpectedDataSet,

    #[snafu(display("Could not decode command set"))]
    DecodeCommand { source: crate::command::Error },

    #[snafu(display("Maximum PDU length {} leaves no room for a fragment", max_pdu_length))]
    MaxPduTooSmall { max_pdu_length: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A fully reassembled DIMSE message.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessage {
    /// the presentation context the message arrived on
    pub presentation_context_id: u8,
    /// the decoded command set
    pub command: CommandSet,
    /// the data set bytes, present iff the command declares one
    pub data: Option<Vec<u8>>,
}

/// Incremental reassembly of one DIMSE message at a time.
///
/// Fragments are pushed in arrival order.
/// When the message completes,
/// the assembler yields it and resets itself,
/// ready for the next message on the same association.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    presentation_context_id: Option<u8>,
    command_buffer: Vec<u8>,
    data_buffer: Vec<u8>,
    command: Option<CommandSet>,
    data_complete: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        MessageAssembler::default()
    }

    /// Whether the assembler holds no partial message.
    pub fn is_idle(&self) -> bool {
        self.presentation_context_id.is_none()
    }

    /// Feed one presentation data value to the assembler.
    ///
    /// Returns the assembled message once the final fragment arrives.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<AssembledMessage>> {
        match self.presentation_context_id {
            None => self.presentation_context_id = Some(pdv.presentation_context_id),
            Some(expected) => ensure!(
                expected == pdv.presentation_context_id,
                ContextIdMismatchSnafu {
                    expected,
                    got: pdv.presentation_context_id
                }
            ),
        }

        match pdv.value_type {
            PDataValueType::Command => {
                ensure!(self.command.is_none(), CommandAlreadyCompleteSnafu);
                self.command_buffer.extend(pdv.data);
                if pdv.is_last {
                    let command =
                        CommandSet::decode(&self.command_buffer).context(DecodeCommandSnafu)?;
                    self.command = Some(command);
                }
            }
            PDataValueType::Data => {
                ensure!(!self.data_complete, DataSetAlreadyCompleteSnafu);
                self.data_buffer.extend(pdv.data);
                if pdv.is_last {
                    self.data_complete = true;
                }
            }
        }

        self.try_complete()
    }

    fn try_complete(&mut self) -> Result<Option<AssembledMessage>> {
        let Some(command) = self.command.take() else {
            return Ok(None);
        };

        let data = if command.has_data_set() {
            if !self.data_complete {
                // keep waiting for the rest of the data set
                self.command = Some(command);
                return Ok(None);
            }
            Some(std::mem::take(&mut self.data_buffer))
        } else {
            ensure!(
                self.data_buffer.is_empty() && !self.data_complete,
                UnexpectedDataSetSnafu
            );
            None
        };

        let presentation_context_id = self.presentation_context_id.take().unwrap_or_default();
        self.command_buffer.clear();
        self.data_buffer.clear();
        self.data_complete = false;

        Ok(Some(AssembledMessage {
            presentation_context_id,
            command,
            data,
        }))
    }
}

/// Split the given bytes into fragments
/// of at most `max_len` bytes each.
/// Empty input produces a single empty fragment,
/// so that the last-fragment flag is always emitted.
fn fragments(bytes: &[u8], max_len: usize) -> Vec<(&[u8], bool)> {
    if bytes.is_empty() {
        return vec![(bytes, true)];
    }
    let count = (bytes.len() + max_len - 1) / max_len;
    bytes
        .chunks(max_len)
        .enumerate()
        .map(|(i, chunk)| (chunk, i + 1 == count))
        .collect()
}

/// Fragment one outbound DIMSE message into P-DATA-TF PDUs,
/// one presentation data value per PDU,
/// each PDU no longer than `max_pdu_length`.
///
/// All command fragments precede all data set fragments,
/// and only the final fragment of each kind
/// carries the last-fragment flag.
pub fn fragment_message(
    presentation_context_id: u8,
    command: &[u8],
    data: Option<&[u8]>,
    max_pdu_length: u32,
) -> Result<Vec<Pdu>> {
    ensure!(
        max_pdu_length > PDV_OVERHEAD,
        MaxPduTooSmallSnafu { max_pdu_length }
    );
    let max_data_length = (max_pdu_length - PDV_OVERHEAD) as usize;

    let mut pdus = Vec::new();

    for (chunk, is_last) in fragments(command, max_data_length) {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last,
                data: chunk.to_vec(),
            }],
        });
    }

    if let Some(data) = data {
        for (chunk, is_last) in fragments(data, max_data_length) {
            pdus.push(Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id,
                    value_type: PDataValueType::Data,
                    is_last,
                    data: chunk.to_vec(),
                }],
            });
        }
    }

    Ok(pdus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicomnet_core::tag::tags;
    use dicomnet_core::VR;

    fn command_with_data_set(present: bool) -> CommandSet {
        let mut cmd = CommandSet::new();
        cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, VR::UI, "1.2.840.10008.1.1");
        cmd.put_u16(tags::COMMAND_FIELD, 0x0001);
        cmd.put_u16(tags::MESSAGE_ID, 7);
        cmd.put_u16(
            tags::COMMAND_DATA_SET_TYPE,
            if present { 0x0000 } else { crate::command::NO_DATA_SET },
        );
        cmd
    }

    fn collect_pdvs(pdus: Vec<Pdu>) -> Vec<PDataValue> {
        pdus.into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                other => panic!("expected P-DATA-TF, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn fragment_payloads_respect_max_pdu_length() {
        let cmd = command_with_data_set(true).encode();
        let data = vec![0xAB; 10_000];
        let max = 4_096;

        let pdvs = collect_pdvs(fragment_message(3, &cmd, Some(&data), max).unwrap());

        for pdv in &pdvs {
            assert!(pdv.data.len() <= (max - PDV_OVERHEAD) as usize);
            assert_eq!(pdv.presentation_context_id, 3);
        }

        // all command fragments precede all data fragments
        let first_data = pdvs
            .iter()
            .position(|pdv| pdv.value_type == PDataValueType::Data)
            .unwrap();
        assert!(pdvs[..first_data]
            .iter()
            .all(|pdv| pdv.value_type == PDataValueType::Command));
        assert!(pdvs[first_data..]
            .iter()
            .all(|pdv| pdv.value_type == PDataValueType::Data));

        // only the final fragment of each kind is marked last
        let last_flags: Vec<_> = pdvs.iter().filter(|pdv| pdv.is_last).collect();
        assert_eq!(last_flags.len(), 2);
        assert_eq!(last_flags[0].value_type, PDataValueType::Command);
        assert_eq!(last_flags[1].value_type, PDataValueType::Data);
    }

    #[test]
    fn command_only_message_emits_no_data_pdvs() {
        let cmd = command_with_data_set(false).encode();
        let pdvs = collect_pdvs(fragment_message(1, &cmd, None, 16_384).unwrap());
        assert!(pdvs
            .iter()
            .all(|pdv| pdv.value_type == PDataValueType::Command));
        assert!(pdvs.last().unwrap().is_last);
    }

    #[test]
    fn fragment_then_assemble_round_trip() {
        let command = command_with_data_set(true);
        let data = (0..9_999u32).map(|x| x as u8).collect::<Vec<_>>();
        let pdus = fragment_message(5, &command.encode(), Some(&data), 4_096).unwrap();

        let mut assembler = MessageAssembler::new();
        let mut message = None;
        for pdv in collect_pdvs(pdus) {
            if let Some(complete) = assembler.push(pdv).unwrap() {
                assert!(message.is_none(), "only one message expected");
                message = Some(complete);
            }
        }

        let message = message.expect("message must complete");
        assert_eq!(message.presentation_context_id, 5);
        assert_eq!(message.command, command);
        assert_eq!(message.data.as_deref(), Some(&data[..]));
        assert!(assembler.is_idle());
    }

    #[test]
    fn assembler_completes_without_data_set() {
        let command = command_with_data_set(false);
        let mut assembler = MessageAssembler::new();
        let message = assembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command.encode(),
            })
            .unwrap()
            .expect("command-only message completes at once");
        assert_eq!(message.command, command);
        assert_eq!(message.data, None);
    }

    #[test]
    fn assembler_rejects_context_id_changes() {
        let command = command_with_data_set(true);
        let mut assembler = MessageAssembler::new();
        assembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command.encode(),
            })
            .unwrap();

        let outcome = assembler.push(PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![1, 2, 3],
        });
        assert!(matches!(
            outcome,
            Err(Error::ContextIdMismatch {
                expected: 1,
                got: 3
            })
        ));
    }

    #[test]
    fn assembler_rejects_data_for_dataless_command() {
        let command = command_with_data_set(false);
        let mut assembler = MessageAssembler::new();

        let outcome = assembler.push(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: false,
            data: vec![0; 8],
        });
        assert!(outcome.is_ok(), "data may arrive buffered first");

        let outcome = assembler.push(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: command.encode(),
        });
        assert!(matches!(outcome, Err(Error::UnexpectedDataSet)));
    }
}
