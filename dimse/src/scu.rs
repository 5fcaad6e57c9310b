//! DIMSE service class user flows over an established association.

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use dicomnet_ul::association::client::ClientAssociation;
use dicomnet_ul::pdata::AssembledMessage;

use crate::identifier::{FlatIdentifier, InformationModel};
use crate::message::{self, DimseMessage, Priority, StatusClass, SubOperations};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// association failure during a DIMSE operation
    Association {
        source: dicomnet_ul::association::client::Error,
    },

    #[snafu(display("no accepted presentation context for {}", abstract_syntax))]
    NoPresentationContext { abstract_syntax: String },

    /// malformed command set in response
    Command {
        source: dicomnet_ul::command::Error,
    },

    /// could not classify the incoming DIMSE message
    Classify {
        source: crate::message::ClassifyError,
    },

    #[snafu(display("unexpected DIMSE message {:?}", field))]
    UnexpectedMessage { field: crate::message::CommandField },

    #[snafu(display("response for message {} arrived, expected {}", got, expected))]
    MessageIdMismatch { expected: u16, got: u16 },

    #[snafu(display("peer responded with unrecognized status 0x{:04X}", status))]
    UnknownStatus { status: u16 },

    /// invalid query identifier
    Identifier { source: crate::identifier::Error },

    /// a pending response arrived without its identifier data set
    MissingIdentifierData,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A C-STORE request for one SOP instance.
#[derive(Debug, Clone)]
pub struct StoreRequest<'a> {
    pub sop_class_uid: &'a str,
    pub sop_instance_uid: &'a str,
    /// the data set bytes, already in the negotiated transfer syntax
    pub data: &'a [u8],
    pub priority: Priority,
    /// AE title and message id of the C-MOVE
    /// this store is a sub-operation of
    pub move_originator: Option<(&'a str, u16)>,
}

/// The outcome of a single DIMSE operation with a final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub message_id: u16,
    pub status: u16,
    pub class: StatusClass,
}

impl Outcome {
    /// Whether the operation is to be considered successful,
    /// counting warnings as non-fatal.
    pub fn is_success(&self) -> bool {
        matches!(self.class, StatusClass::Success | StatusClass::Warning)
    }
}

/// One match yielded by a C-FIND operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FindMatch {
    /// the match identifier, encoded in `transfer_syntax_uid`
    pub data: Vec<u8>,
    pub transfer_syntax_uid: String,
}

/// One progress report of a C-MOVE operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveProgress {
    pub status: u16,
    pub class: StatusClass,
    pub sub_operations: SubOperations,
}

/// An event yielded by a C-GET operation.
#[derive(Debug, Clone, PartialEq)]
pub enum GetEvent {
    /// an instance delivered on the same association
    Instance(RetrievedInstance),
    /// a C-GET response carrying sub-operation counts
    Progress(MoveProgress),
}

/// An instance received as a C-GET sub-operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedInstance {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// the transfer syntax negotiated for the context
    /// the instance arrived on
    pub transfer_syntax_uid: String,
    pub data: Vec<u8>,
}

/// A DIMSE service class user over one established association.
///
/// Message ids increase monotonically within the association.
#[derive(Debug)]
pub struct ServiceUser {
    association: ClientAssociation,
    next_message_id: u16,
}

impl ServiceUser {
    pub fn new(association: ClientAssociation) -> Self {
        ServiceUser {
            association,
            next_message_id: 1,
        }
    }

    /// Access the underlying association.
    pub fn association(&self) -> &ClientAssociation {
        &self.association
    }

    /// Consume the service user, returning the association.
    pub fn into_inner(self) -> ClientAssociation {
        self.association
    }

    /// Gracefully release the underlying association.
    pub fn release(mut self) -> Result<()> {
        self.association.release().context(AssociationSnafu)
    }

    /// Abort the underlying association.
    pub fn abort(mut self) -> Result<()> {
        self.association.abort().context(AssociationSnafu)
    }

    fn fresh_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// Find the accepted presentation context for the given
    /// abstract syntax: its id and transfer syntax.
    fn context_for(&self, abstract_syntax: &str) -> Result<(u8, String)> {
        self.association
            .accepted_presentation_contexts()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
            .map(|pc| (pc.id, pc.transfer_syntax.clone()))
            .context(NoPresentationContextSnafu { abstract_syntax })
    }

    fn receive_classified(&mut self) -> Result<DimseMessage> {
        let message = self
            .association
            .receive_message()
            .context(AssociationSnafu)?;
        DimseMessage::classify(message).context(ClassifySnafu)
    }

    /// Verification: send a C-ECHO-RQ and await its response.
    pub fn echo(&mut self) -> Result<Outcome> {
        let (pc_id, _) = self.context_for(dicomnet_core::uids::VERIFICATION)?;
        let message_id = self.fresh_message_id();

        self.association
            .send_message(pc_id, &message::echo_rq(message_id), None)
            .context(AssociationSnafu)?;

        let rsp = self.receive_classified()?;
        let DimseMessage::CEchoRsp(rsp) = rsp else {
            return UnexpectedMessageSnafu {
                field: rsp.command_field(),
            }
            .fail();
        };
        self.final_outcome(&rsp, message_id)
    }

    /// Storage: send one instance with C-STORE
    /// and await the final status.
    pub fn store(&mut self, request: StoreRequest<'_>) -> Result<Outcome> {
        let (pc_id, _) = self.context_for(request.sop_class_uid)?;
        let message_id = self.fresh_message_id();

        let command = message::store_rq(
            message_id,
            request.sop_class_uid,
            request.sop_instance_uid,
            request.priority,
            request.move_originator,
        );
        debug!(
            sop_instance_uid = request.sop_instance_uid,
            message_id, "sending C-STORE-RQ"
        );
        self.association
            .send_message(pc_id, &command, Some(request.data))
            .context(AssociationSnafu)?;

        let rsp = self.receive_classified()?;
        let DimseMessage::CStoreRsp(rsp) = rsp else {
            return UnexpectedMessageSnafu {
                field: rsp.command_field(),
            }
            .fail();
        };
        self.final_outcome(&rsp, message_id)
    }

    /// Query: send a C-FIND-RQ and iterate over the matches lazily.
    ///
    /// The returned sequence ends at the first non-pending status;
    /// it is finite and not restartable.
    pub fn find(
        &mut self,
        model: InformationModel,
        identifier: &FlatIdentifier,
        priority: Priority,
    ) -> Result<FindResults<'_>> {
        identifier.check_level(model).context(IdentifierSnafu)?;

        let abstract_syntax = model.find_sop_class();
        let (pc_id, transfer_syntax) = self.context_for(abstract_syntax)?;
        let data = identifier
            .encode_for(&transfer_syntax)
            .context(IdentifierSnafu)?;

        let message_id = self.fresh_message_id();
        let command = message::find_rq(message_id, abstract_syntax, priority);
        self.association
            .send_message(pc_id, &command, Some(&data))
            .context(AssociationSnafu)?;

        Ok(FindResults {
            scu: self,
            message_id,
            presentation_context_id: pc_id,
            transfer_syntax,
            outcome: None,
        })
    }

    /// Retrieve to a third party:
    /// send a C-MOVE-RQ directing sub-operations at `destination_ae`
    /// and iterate over the progress reports.
    pub fn move_to(
        &mut self,
        model: InformationModel,
        destination_ae: &str,
        identifier: &FlatIdentifier,
        priority: Priority,
    ) -> Result<MoveResults<'_>> {
        identifier.check_level(model).context(IdentifierSnafu)?;

        let abstract_syntax = model.move_sop_class();
        let (pc_id, transfer_syntax) = self.context_for(abstract_syntax)?;
        let data = identifier
            .encode_for(&transfer_syntax)
            .context(IdentifierSnafu)?;

        let message_id = self.fresh_message_id();
        let command = message::move_rq(message_id, abstract_syntax, destination_ae, priority);
        self.association
            .send_message(pc_id, &command, Some(&data))
            .context(AssociationSnafu)?;

        Ok(MoveResults {
            scu: self,
            message_id,
            presentation_context_id: pc_id,
            outcome: None,
        })
    }

    /// Retrieve on this association:
    /// send a C-GET-RQ and iterate over the interleaved
    /// incoming instances and progress reports.
    ///
    /// The association must have accepted presentation contexts
    /// for the storage SOP classes of the expected instances.
    pub fn get(
        &mut self,
        model: InformationModel,
        identifier: &FlatIdentifier,
        priority: Priority,
    ) -> Result<GetResults<'_>> {
        identifier.check_level(model).context(IdentifierSnafu)?;

        let abstract_syntax = model.get_sop_class();
        let (pc_id, transfer_syntax) = self.context_for(abstract_syntax)?;
        let data = identifier
            .encode_for(&transfer_syntax)
            .context(IdentifierSnafu)?;

        let message_id = self.fresh_message_id();
        let command = message::get_rq(message_id, abstract_syntax, priority);
        self.association
            .send_message(pc_id, &command, Some(&data))
            .context(AssociationSnafu)?;

        Ok(GetResults {
            scu: self,
            message_id,
            presentation_context_id: pc_id,
            outcome: None,
        })
    }

    /// Request cancellation of the outstanding operation
    /// with the given message id,
    /// on the presentation context it was issued on.
    ///
    /// No direct response is expected;
    /// the original operation eventually completes
    /// with a cancel status.
    pub fn cancel(&mut self, presentation_context_id: u8, message_id: u16) -> Result<()> {
        self.association
            .send_message(
                presentation_context_id,
                &message::cancel_rq(message_id),
                None,
            )
            .context(AssociationSnafu)
    }

    /// Validate and convert a final response into an [`Outcome`].
    fn final_outcome(&self, rsp: &AssembledMessage, message_id: u16) -> Result<Outcome> {
        let command = &rsp.command;
        if let Ok(got) = command.message_id_being_responded_to() {
            ensure!(
                got == message_id,
                MessageIdMismatchSnafu {
                    expected: message_id,
                    got
                }
            );
        }
        let status = command.status().context(CommandSnafu)?;
        let class = StatusClass::of(status).context(UnknownStatusSnafu { status })?;
        Ok(Outcome {
            message_id,
            status,
            class,
        })
    }
}

/// The lazy sequence of C-FIND matches.
///
/// Ends at the first non-pending status;
/// the final status is available through
/// [`FindResults::outcome`] afterwards.
#[derive(Debug)]
pub struct FindResults<'a> {
    scu: &'a mut ServiceUser,
    message_id: u16,
    presentation_context_id: u8,
    transfer_syntax: String,
    outcome: Option<Outcome>,
}

impl FindResults<'_> {
    /// The message id of the C-FIND operation.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// The final status, once the sequence has ended.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Request cancellation of this C-FIND operation.
    pub fn cancel(&mut self) -> Result<()> {
        let (pc, id) = (self.presentation_context_id, self.message_id);
        self.scu.cancel(pc, id)
    }

    fn pull(&mut self) -> Result<Option<FindMatch>> {
        let rsp = self.scu.receive_classified()?;
        let DimseMessage::CFindRsp(rsp) = rsp else {
            return UnexpectedMessageSnafu {
                field: rsp.command_field(),
            }
            .fail();
        };

        let status = rsp.command.status().context(CommandSnafu)?;
        let class = StatusClass::of(status).context(UnknownStatusSnafu { status })?;
        if class == StatusClass::Pending {
            let data = rsp.data.context(MissingIdentifierDataSnafu)?;
            return Ok(Some(FindMatch {
                data,
                transfer_syntax_uid: self.transfer_syntax.clone(),
            }));
        }

        if class == StatusClass::Failure {
            warn!(status, "C-FIND terminated with a failure status");
        }
        self.outcome = Some(Outcome {
            message_id: self.message_id,
            status,
            class,
        });
        Ok(None)
    }
}

impl Iterator for FindResults<'_> {
    type Item = Result<FindMatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.outcome.is_some() {
            return None;
        }
        match self.pull() {
            Ok(Some(found)) => Some(Ok(found)),
            Ok(None) => None,
            Err(e) => {
                // end the sequence on transport failure
                self.outcome = Some(Outcome {
                    message_id: self.message_id,
                    status: 0xC000,
                    class: StatusClass::Failure,
                });
                Some(Err(e))
            }
        }
    }
}

/// The sequence of C-MOVE progress reports,
/// ending with the report of the final status.
#[derive(Debug)]
pub struct MoveResults<'a> {
    scu: &'a mut ServiceUser,
    message_id: u16,
    presentation_context_id: u8,
    outcome: Option<Outcome>,
}

impl MoveResults<'_> {
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Request cancellation of this C-MOVE operation.
    pub fn cancel(&mut self) -> Result<()> {
        let (pc, id) = (self.presentation_context_id, self.message_id);
        self.scu.cancel(pc, id)
    }

    fn pull(&mut self) -> Result<MoveProgress> {
        let rsp = self.scu.receive_classified()?;
        let DimseMessage::CMoveRsp(rsp) = rsp else {
            return UnexpectedMessageSnafu {
                field: rsp.command_field(),
            }
            .fail();
        };

        let status = rsp.command.status().context(CommandSnafu)?;
        let class = StatusClass::of(status).context(UnknownStatusSnafu { status })?;
        let progress = MoveProgress {
            status,
            class,
            sub_operations: SubOperations::from_command(&rsp.command),
        };
        if class != StatusClass::Pending {
            self.outcome = Some(Outcome {
                message_id: self.message_id,
                status,
                class,
            });
        }
        Ok(progress)
    }
}

impl Iterator for MoveResults<'_> {
    type Item = Result<MoveProgress>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.outcome.is_some() {
            return None;
        }
        Some(self.pull().map_err(|e| {
            self.outcome = Some(Outcome {
                message_id: self.message_id,
                status: 0xC000,
                class: StatusClass::Failure,
            });
            e
        }))
    }
}

/// The sequence of C-GET events:
/// instances delivered on this association,
/// interleaved with progress reports,
/// ending with the report of the final status.
#[derive(Debug)]
pub struct GetResults<'a> {
    scu: &'a mut ServiceUser,
    message_id: u16,
    presentation_context_id: u8,
    outcome: Option<Outcome>,
}

impl GetResults<'_> {
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Request cancellation of this C-GET operation.
    pub fn cancel(&mut self) -> Result<()> {
        let (pc, id) = (self.presentation_context_id, self.message_id);
        self.scu.cancel(pc, id)
    }

    /// Answer an incoming C-STORE-RQ sub-operation
    /// with a success response
    /// and surface the instance to the caller.
    fn accept_sub_store(&mut self, message: AssembledMessage) -> Result<GetEvent> {
        let command = &message.command;
        let sub_message_id = command.message_id().context(CommandSnafu)?;
        let sop_class_uid = command
            .affected_sop_class_uid()
            .context(CommandSnafu)?
            .to_string();
        let sop_instance_uid = command
            .affected_sop_instance_uid()
            .context(CommandSnafu)?
            .to_string();

        let transfer_syntax_uid = self
            .scu
            .association
            .presentation_contexts()
            .iter()
            .find(|pc| pc.id == message.presentation_context_id)
            .map(|pc| pc.transfer_syntax.clone())
            .unwrap_or_else(|| dicomnet_core::uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string());

        let rsp = message::store_rsp(sub_message_id, &sop_class_uid, &sop_instance_uid, 0x0000);
        self.scu
            .association
            .send_message(message.presentation_context_id, &rsp, None)
            .context(AssociationSnafu)?;

        Ok(GetEvent::Instance(RetrievedInstance {
            sop_class_uid,
            sop_instance_uid,
            transfer_syntax_uid,
            data: message.data.unwrap_or_default(),
        }))
    }

    fn pull(&mut self) -> Result<GetEvent> {
        let rsp = self.scu.receive_classified()?;
        match rsp {
            DimseMessage::CStoreRq(message) => self.accept_sub_store(message),
            DimseMessage::CGetRsp(rsp) => {
                let status = rsp.command.status().context(CommandSnafu)?;
                let class = StatusClass::of(status).context(UnknownStatusSnafu { status })?;
                let progress = MoveProgress {
                    status,
                    class,
                    sub_operations: SubOperations::from_command(&rsp.command),
                };
                if class != StatusClass::Pending {
                    self.outcome = Some(Outcome {
                        message_id: self.message_id,
                        status,
                        class,
                    });
                }
                Ok(GetEvent::Progress(progress))
            }
            other => UnexpectedMessageSnafu {
                field: other.command_field(),
            }
            .fail(),
        }
    }
}

impl Iterator for GetResults<'_> {
    type Item = Result<GetEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.outcome.is_some() {
            return None;
        }
        Some(self.pull().map_err(|e| {
            self.outcome = Some(Outcome {
                message_id: self.message_id,
                status: 0xC000,
                class: StatusClass::Failure,
            });
            e
        }))
    }
}
