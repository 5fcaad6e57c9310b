//! Association requester module
//!
//! The [`ClientAssociation`] drives the upper layer state machine
//! over a TCP transport:
//! every wire event is fed to [`crate::machine::transition`]
//! and the produced actions are executed in order,
//! so that the association can only move
//! along the paths the protocol allows.

use std::borrow::Cow;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use snafu::{ensure, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::command::CommandSet;
use crate::machine::{self, Action, Event, State};
use crate::pdata::{fragment_message, AssembledMessage, MessageAssembler};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ,
    AssociationRJResult, AssociationRJSource, AssociationRQ, Pdu, PresentationContextProposed,
    PresentationContextResultReason, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax,

    /// could not resolve the target address
    ResolveAddress { source: std::io::Error },

    /// could not connect to the service class provider
    Connect { source: std::io::Error },

    /// could not configure the transport socket
    ConfigureSocket { source: std::io::Error },

    /// failed to send association request
    SendRequest { source: crate::pdu::writer::Error },

    /// failed to send PDU message
    Send { source: crate::pdu::writer::Error },

    /// failed to receive PDU message
    Receive { source: crate::pdu::reader::Error },

    #[snafu(display("unexpected response from SCP: {}", pdu.short_description()))]
    UnexpectedResponse {
        /// the PDU obtained from the server
        pdu: Box<Pdu>,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch { expected: u16, got: u16 },

    /// the association was rejected by the service class provider
    Rejected {
        association_result: AssociationRJResult,
        association_source: AssociationRJSource,
    },

    /// the peer aborted the association
    PeerAborted { abort_source: AbortRQSource },

    /// the peer requested the release of the association
    PeerReleased,

    /// no presentation contexts accepted by the service class provider
    NoAcceptedPresentationContexts,

    #[snafu(display("association timer expired after {:?}", timeout))]
    ArtimExpired { timeout: Duration },

    /// operation timed out
    Timeout { source: std::io::Error },

    /// connection closed by the peer
    ConnectionClosed,

    #[snafu(display("PDU is too large to send ({} bytes, maximum is {})", length, maximum))]
    SendTooLongPdu { length: usize, maximum: u32 },

    #[snafu(display("operation `{}` is invalid in state {:?}", operation, state))]
    InvalidState {
        operation: &'static str,
        state: State,
    },

    #[snafu(display("protocol violation: event {:?} in state {:?}", event, state))]
    ProtocolViolation { state: State, event: Event },

    /// failed to reassemble incoming message
    Assemble { source: crate::pdata::Error },

    /// failed to fragment outgoing message
    Fragment { source: crate::pdata::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The association-level view of one negotiated presentation context:
/// the proposed abstract syntax joined
/// with the acceptor's verdict and chosen transfer syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

impl NegotiatedContext {
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// A DICOM association builder for a service class user (SCU).
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicomnet_ul::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .establish_with("SCP@129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// The SCU proposes by default the transfer syntaxes
/// _Explicit VR Little Endian_ and _Implicit VR Little Endian_
/// for each presentation context
/// without an explicit transfer syntax list.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    /// the calling AE title
    calling_ae_title: Cow<'static, str>,
    /// the called AE title
    called_ae_title: Cow<'static, str>,
    /// the requested application context name
    application_context_name: Cow<'static, str>,
    /// the list of requested presentation contexts
    /// (abstract syntax, proposed transfer syntaxes)
    presentation_contexts: Vec<(Cow<'static, str>, Vec<Cow<'static, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length this SCU is willing to receive
    max_pdu_length: u32,
    /// whether to receive PDUs strictly under the maximum PDU length
    strict: bool,
    /// the user identity to present at negotiation
    user_identity: Option<UserIdentity>,
    /// timeout for connecting the transport
    connect_timeout: Option<Duration>,
    /// timeout for reading a PDU in data transfer
    read_timeout: Option<Duration>,
    /// timeout for writing a PDU
    write_timeout: Option<Duration>,
    /// time to wait for association and release responses (ARTIM)
    association_timeout: Duration,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: dicomnet_core::uids::APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            user_identity: None,
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            association_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context with this abstract syntax
    /// and the default transfer syntaxes.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_presentation_context(abstract_syntax_uid, Vec::new())
    }

    /// Propose a presentation context with this abstract syntax
    /// and the given transfer syntaxes in order of preference.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.presentation_contexts.push((
            abstract_syntax_uid.into(),
            transfer_syntax_uids.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Override the maximum PDU length
    /// that this application entity is willing to receive.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether to accept incoming PDUs
    /// larger than the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Present the given user identity at association negotiation.
    pub fn user_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }

    /// Set the timeout for connecting the transport.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the timeout for reading a PDU during data transfer.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the timeout for writing a PDU.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Set the association (ARTIM) timeout:
    /// the time to wait for association and release responses.
    ///
    /// The default is 30 seconds.
    pub fn association_timeout(mut self, timeout: Duration) -> Self {
        self.association_timeout = timeout;
        self
    }

    /// Initiate the TCP connection and negotiate the association
    /// with the node at the given socket address.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        let addresses: Vec<SocketAddr> = address
            .to_socket_addrs()
            .context(ResolveAddressSnafu)?
            .collect();
        self.establish_impl(&addresses)
    }

    /// Initiate the connection and negotiation
    /// from a compound `{ae_title}@{host}:{port}` address,
    /// taking the called AE title from the address when present.
    pub fn establish_with(self, ae_address: &str) -> Result<ClientAssociation> {
        match ae_address.parse::<crate::address::FullAeAddr>() {
            Ok(full_addr) => {
                let options = self.called_ae_title(full_addr.ae_title().to_string());
                let addresses: Vec<SocketAddr> = full_addr
                    .to_socket_addrs()
                    .context(ResolveAddressSnafu)?
                    .collect();
                options.establish_impl(&addresses)
            }
            Err(_) => self.establish(ae_address),
        }
    }

    fn establish_impl(self, addresses: &[SocketAddr]) -> Result<ClientAssociation> {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            protocol_version,
            max_pdu_length,
            strict,
            user_identity,
            connect_timeout,
            read_timeout,
            write_timeout,
            association_timeout,
        } = self;

        // abstract syntaxes represent intent,
        // they must not be omitted by the user
        ensure!(!presentation_contexts.is_empty(), MissingAbstractSyntaxSnafu);

        let proposed: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, mut transfer_syntaxes))| {
                if transfer_syntaxes.is_empty() {
                    transfer_syntaxes.push(dicomnet_core::uids::EXPLICIT_VR_LITTLE_ENDIAN.into());
                    transfer_syntaxes.push(dicomnet_core::uids::IMPLICIT_VR_LITTLE_ENDIAN.into());
                }
                PresentationContextProposed {
                    // presentation context ids are odd within 1..=255
                    id: (i as u8) * 2 + 1,
                    abstract_syntax: abstract_syntax.to_string(),
                    transfer_syntaxes: transfer_syntaxes
                        .iter()
                        .map(|uid| uid.to_string())
                        .collect(),
                }
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUID(
                crate::IMPLEMENTATION_CLASS_UID.to_string(),
            ),
            UserVariableItem::ImplementationVersionName(
                crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            ),
        ];
        if let Some(identity) = user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(identity));
        }

        let msg = Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: proposed.clone(),
            user_variables,
        });

        let mut state = State::Sta1Idle;

        let mut socket = connect_any(addresses, connect_timeout)?;
        state = machine::transition(state, Event::TransportConnected).next;

        socket
            .set_write_timeout(write_timeout)
            .context(ConfigureSocketSnafu)?;

        // send request
        write_pdu(&mut socket, &msg).context(SendRequestSnafu)?;
        state = machine::transition(state, Event::AssociateRequestSent).next;

        // ARTIM window: bound the wait for the association response
        socket
            .set_read_timeout(Some(association_timeout))
            .context(ConfigureSocketSnafu)?;

        let msg = match read_pdu(&mut socket, max_pdu_length, strict) {
            Ok(Some(pdu)) => pdu,
            Ok(None) => {
                machine::transition(state, Event::TransportConnectionFailed);
                return ConnectionClosedSnafu.fail();
            }
            Err(e) if reader_timed_out(&e) => {
                let transition = machine::transition(state, Event::ArtimTimerExpired);
                abort_on_artim_expiry(&mut socket, &transition.actions);
                return ArtimExpiredSnafu {
                    timeout: association_timeout,
                }
                .fail();
            }
            Err(e) => return Err(e).context(ReceiveSnafu),
        };

        match msg {
            Pdu::AssociationAC(ac) => {
                state = machine::transition(state, Event::AssociateAcceptReceived).next;
                debug_assert_eq!(state, State::Sta6Established);

                ensure!(
                    ac.protocol_version == protocol_version,
                    ProtocolVersionMismatchSnafu {
                        expected: protocol_version,
                        got: ac.protocol_version,
                    }
                );

                // join the acceptor's verdicts with the proposed contexts
                let presentation_contexts: Vec<_> = ac
                    .presentation_contexts
                    .into_iter()
                    .filter_map(|result| {
                        proposed.iter().find(|pc| pc.id == result.id).map(|pc| {
                            NegotiatedContext {
                                id: result.id,
                                reason: result.reason,
                                abstract_syntax: pc.abstract_syntax.clone(),
                                transfer_syntax: result.transfer_syntax,
                            }
                        })
                    })
                    .collect();

                if !presentation_contexts.iter().any(NegotiatedContext::is_accepted) {
                    // no point in keeping the association open
                    let _ = write_pdu(
                        &mut socket,
                        &Pdu::AbortRQ {
                            source: AbortRQSource::ServiceUser,
                        },
                    );
                    let _ = socket.shutdown(Shutdown::Both);
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                let acceptor_max_pdu_length = ac
                    .user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(value) => Some(*value),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);

                // leave the ARTIM window
                socket
                    .set_read_timeout(read_timeout)
                    .context(ConfigureSocketSnafu)?;

                debug!(
                    accepted = presentation_contexts
                        .iter()
                        .filter(|pc| pc.is_accepted())
                        .count(),
                    acceptor_max_pdu_length, "association established"
                );

                Ok(ClientAssociation {
                    state,
                    presentation_contexts,
                    requestor_max_pdu_length: max_pdu_length,
                    acceptor_max_pdu_length,
                    socket,
                    assembler: MessageAssembler::new(),
                    strict,
                    read_timeout,
                    association_timeout,
                })
            }
            Pdu::AssociationRJ(AssociationRJ { result, source }) => {
                let transition = machine::transition(state, Event::AssociateRejectReceived);
                if transition.actions.contains(&Action::CloseTransport) {
                    let _ = socket.shutdown(Shutdown::Both);
                }
                RejectedSnafu {
                    association_result: result,
                    association_source: source,
                }
                .fail()
            }
            Pdu::AbortRQ { source } => {
                let transition = machine::transition(state, Event::AbortReceived);
                if transition.actions.contains(&Action::CloseTransport) {
                    let _ = socket.shutdown(Shutdown::Both);
                }
                PeerAbortedSnafu {
                    abort_source: source,
                }
                .fail()
            }
            pdu => {
                // receiving anything else at this point is a protocol violation
                let _ = write_pdu(
                    &mut socket,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnexpectedPdu,
                        ),
                    },
                );
                let _ = socket.shutdown(Shutdown::Both);
                UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }
}

fn connect_any(
    addresses: &[SocketAddr],
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let mut last_error = None;
    for address in addresses {
        let outcome = match connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(address, timeout),
            None => TcpStream::connect(address),
        };
        match outcome {
            Ok(socket) => return Ok(socket),
            Err(e) => last_error = Some(e),
        }
    }
    let source = last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to connect to")
    });
    Err(source).context(ConnectSnafu)
}

/// Whether the given reader error is an expired socket read timeout.
fn reader_timed_out(error: &crate::pdu::reader::Error) -> bool {
    use crate::pdu::reader::Error as E;
    let kind = match error {
        E::ReadPdu { source, .. }
        | E::ReadPduItem { source, .. }
        | E::ReadPduField { source, .. }
        | E::ReadReserved { source, .. } => source.kind(),
        _ => return false,
    };
    matches!(
        kind,
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

fn abort_on_artim_expiry(socket: &mut TcpStream, actions: &[Action]) {
    for action in actions {
        if let Action::SendAbort { source } = action {
            let _ = write_pdu(
                socket,
                &Pdu::AbortRQ {
                    source: source.clone(),
                },
            );
        }
    }
    let _ = socket.shutdown(Shutdown::Both);
}

/// A DICOM upper level association from the perspective
/// of an association requester.
///
/// The association object owns its transport exclusively.
/// Reads and writes are sequential;
/// concurrent users must serialize their access.
/// Dropping an established association
/// makes a best effort attempt at a graceful release.
#[derive(Debug)]
pub struct ClientAssociation {
    /// the current state of the upper layer machine
    state: State,
    /// all negotiated presentation contexts
    presentation_contexts: Vec<NegotiatedContext>,
    /// the maximum PDU length this node is willing to receive
    requestor_max_pdu_length: u32,
    /// the maximum PDU length the acceptor is willing to receive
    acceptor_max_pdu_length: u32,
    /// the TCP stream to the other DICOM node
    socket: TcpStream,
    /// reassembly of incoming DIMSE messages
    assembler: MessageAssembler,
    /// whether to accept PDUs under the maximum PDU length only
    strict: bool,
    /// timeout for reading a PDU in data transfer
    read_timeout: Option<Duration>,
    /// time to wait for release responses (ARTIM)
    association_timeout: Duration,
}

impl ClientAssociation {
    /// Retrieve all negotiated presentation contexts,
    /// including the ones the acceptor turned down.
    pub fn presentation_contexts(&self) -> &[NegotiatedContext] {
        &self.presentation_contexts
    }

    /// Retrieve the accepted presentation contexts.
    pub fn accepted_presentation_contexts(
        &self,
    ) -> impl Iterator<Item = &NegotiatedContext> {
        self.presentation_contexts
            .iter()
            .filter(|pc| pc.is_accepted())
    }

    /// The maximum PDU length this node proposed to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// The maximum PDU length the acceptor is willing to receive.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// The effective maximum PDU length of the association:
    /// the minimum of both peers' declared values,
    /// a declared 0 meaning unlimited,
    /// clamped to the hard limit of the standard.
    pub fn effective_max_pdu_length(&self) -> u32 {
        clamp_max_pdu(self.requestor_max_pdu_length).min(clamp_max_pdu(self.acceptor_max_pdu_length))
    }

    /// The current upper layer state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Send a PDU message to the other intervenient.
    ///
    /// P-DATA-TF PDUs are checked against
    /// the maximum PDU length accepted by the peer.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        if let Pdu::PData { data } = msg {
            let length: usize = data
                .iter()
                .map(|pdv| pdv.data.len() + 6)
                .sum();
            let maximum = clamp_max_pdu(self.acceptor_max_pdu_length);
            ensure!(
                length <= maximum as usize,
                SendTooLongPduSnafu { length, maximum }
            );
            self.fire(Event::DataTransferSent)?;
        }
        write_pdu(&mut self.socket, msg).context(SendSnafu)
    }

    /// Read a PDU message from the other intervenient,
    /// feeding the corresponding event to the state machine.
    pub fn receive(&mut self) -> Result<Pdu> {
        let pdu = match read_pdu(&mut self.socket, self.requestor_max_pdu_length, self.strict) {
            Ok(Some(pdu)) => pdu,
            Ok(None) => {
                self.fire_lenient(Event::TransportConnectionFailed);
                return ConnectionClosedSnafu.fail();
            }
            Err(e) if reader_timed_out(&e) => {
                return Err(Error::Timeout {
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, e.to_string()),
                })
            }
            Err(e) => {
                // malformed PDU: abort with provider source and surface
                self.abort_provider(AbortRQServiceProviderReason::UnrecognizedPdu);
                return Err(e).context(ReceiveSnafu);
            }
        };

        let event = match &pdu {
            Pdu::PData { .. } => Some(Event::DataTransferReceived),
            Pdu::ReleaseRQ => Some(Event::ReleaseRequestReceived),
            Pdu::ReleaseRP => Some(Event::ReleaseResponseReceived),
            Pdu::AbortRQ { .. } => Some(Event::AbortReceived),
            Pdu::AssociationAC { .. } => Some(Event::AssociateAcceptReceived),
            Pdu::AssociationRJ { .. } => Some(Event::AssociateRejectReceived),
            Pdu::AssociationRQ { .. } => Some(Event::AssociateRequestReceived),
            Pdu::Unknown { .. } => None,
        };
        if let Some(event) = event {
            self.fire(event)?;
        }
        Ok(pdu)
    }

    /// Send one DIMSE message:
    /// the command set and, when present, its data set,
    /// fragmented under the effective maximum PDU length.
    ///
    /// This operation is only valid on an established association.
    pub fn send_message(
        &mut self,
        presentation_context_id: u8,
        command: &CommandSet,
        data: Option<&[u8]>,
    ) -> Result<()> {
        ensure!(
            self.state == State::Sta6Established,
            InvalidStateSnafu {
                operation: "send_message",
                state: self.state,
            }
        );
        let pdus = fragment_message(
            presentation_context_id,
            &command.encode(),
            data,
            self.effective_max_pdu_length(),
        )
        .context(FragmentSnafu)?;
        for pdu in &pdus {
            self.send(pdu)?;
        }
        Ok(())
    }

    /// Receive PDUs until one whole DIMSE message is reassembled.
    ///
    /// Returns [`Error::PeerReleased`] when the peer requests release
    /// (acknowledge with [`ClientAssociation::acknowledge_release`])
    /// and [`Error::PeerAborted`] when the peer aborts the association.
    pub fn receive_message(&mut self) -> Result<AssembledMessage> {
        ensure!(
            self.state == State::Sta6Established,
            InvalidStateSnafu {
                operation: "receive_message",
                state: self.state,
            }
        );
        loop {
            let pdu = self.receive()?;
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        match self.assembler.push(pdv) {
                            Ok(Some(message)) => return Ok(message),
                            Ok(None) => continue,
                            Err(e) => {
                                self.abort_provider(
                                    AbortRQServiceProviderReason::InvalidPduParameter,
                                );
                                return Err(e).context(AssembleSnafu);
                            }
                        }
                    }
                }
                Pdu::ReleaseRQ => return PeerReleasedSnafu.fail(),
                Pdu::AbortRQ { source } => {
                    return PeerAbortedSnafu {
                        abort_source: source,
                    }
                    .fail()
                }
                pdu => return UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail(),
            }
        }
    }

    /// Gracefully release the association,
    /// waiting for the release response under the association timeout
    /// and handling a release collision from the peer.
    pub fn release(&mut self) -> Result<()> {
        ensure!(
            self.state == State::Sta6Established,
            InvalidStateSnafu {
                operation: "release",
                state: self.state,
            }
        );

        self.fire(Event::LocalReleaseRequest)?;

        // ARTIM window: bound the wait for the release response
        self.socket
            .set_read_timeout(Some(self.association_timeout))
            .context(ConfigureSocketSnafu)?;

        loop {
            let pdu = match read_pdu(
                &mut self.socket,
                self.requestor_max_pdu_length,
                self.strict,
            ) {
                Ok(Some(pdu)) => pdu,
                Ok(None) => {
                    self.fire_lenient(Event::TransportConnectionFailed);
                    return ConnectionClosedSnafu.fail();
                }
                Err(e) if reader_timed_out(&e) => {
                    let transition =
                        machine::transition(self.state, Event::ArtimTimerExpired);
                    self.state = transition.next;
                    abort_on_artim_expiry(&mut self.socket, &transition.actions);
                    self.state = State::Sta1Idle;
                    return ArtimExpiredSnafu {
                        timeout: self.association_timeout,
                    }
                    .fail();
                }
                Err(e) => return Err(e).context(ReceiveSnafu),
            };

            match pdu {
                Pdu::ReleaseRP => {
                    // Sta8 or the collision path both end here
                    self.fire(Event::ReleaseResponseReceived)?;
                    if self.state == State::Sta7AwaitingLocalReleaseResponse {
                        // release collision: confirm our side as well
                        self.fire(Event::ReleaseResponseSent)?;
                        let _ = self.socket.shutdown(Shutdown::Both);
                        self.state = State::Sta1Idle;
                    }
                    return Ok(());
                }
                Pdu::ReleaseRQ => {
                    // release collision
                    self.fire(Event::ReleaseRequestReceived)?;
                    self.fire(Event::ReleaseResponseSent)?;
                }
                Pdu::PData { .. } => {
                    // the peer may flush pending data before responding
                    self.fire(Event::DataTransferReceived)?;
                    warn!("discarding P-DATA-TF received during release");
                }
                Pdu::AbortRQ { source } => {
                    self.fire(Event::AbortReceived)?;
                    return PeerAbortedSnafu {
                        abort_source: source,
                    }
                    .fail();
                }
                pdu => {
                    self.abort_provider(AbortRQServiceProviderReason::UnexpectedPdu);
                    return UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail();
                }
            }
        }
    }

    /// Acknowledge a release requested by the peer
    /// (after [`Error::PeerReleased`])
    /// by sending the release response and closing the transport.
    pub fn acknowledge_release(&mut self) -> Result<()> {
        ensure!(
            self.state == State::Sta7AwaitingLocalReleaseResponse,
            InvalidStateSnafu {
                operation: "acknowledge_release",
                state: self.state,
            }
        );
        self.fire(Event::ReleaseResponseSent)?;
        let _ = self.socket.shutdown(Shutdown::Both);
        self.state = State::Sta1Idle;
        Ok(())
    }

    /// Abort the association on behalf of the service user
    /// and close the transport.
    pub fn abort(&mut self) -> Result<()> {
        let transition = machine::transition(self.state, Event::LocalAbortRequest);
        if transition.handled {
            self.state = transition.next;
            for action in transition.actions {
                self.run_action(action)?;
            }
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        self.state = State::Sta1Idle;
        Ok(())
    }

    /// Obtain access to the raw transport stream.
    pub fn inner_stream(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Feed one event to the state machine
    /// and execute the produced actions.
    ///
    /// A pair of state and event outside the protocol
    /// aborts the association with a provider source.
    fn fire(&mut self, event: Event) -> Result<()> {
        let transition = machine::transition(self.state, event);
        if !transition.handled {
            warn!(state = ?self.state, event = ?event, "upper layer protocol violation");
            let state = self.state;
            self.abort_provider(AbortRQServiceProviderReason::UnexpectedPdu);
            return ProtocolViolationSnafu { state, event }.fail();
        }
        self.state = transition.next;
        for action in transition.actions {
            self.run_action(action)?;
        }
        Ok(())
    }

    /// Feed one event without treating unhandled pairs as violations.
    fn fire_lenient(&mut self, event: Event) {
        let transition = machine::transition(self.state, event);
        self.state = transition.next;
    }

    fn run_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::SendAbort { source } => {
                // best effort: the transport may already be gone
                let _ = write_pdu(&mut self.socket, &Pdu::AbortRQ { source });
                Ok(())
            }
            Action::SendReleaseRequest => {
                write_pdu(&mut self.socket, &Pdu::ReleaseRQ).context(SendSnafu)
            }
            Action::SendReleaseResponse => {
                write_pdu(&mut self.socket, &Pdu::ReleaseRP).context(SendSnafu)
            }
            Action::CloseTransport => {
                let _ = self.socket.shutdown(Shutdown::Both);
                Ok(())
            }
            // indications surface through the return values
            // of the calling operation
            Action::IssueAssociateConfirmAccept
            | Action::IssueAssociateConfirmReject
            | Action::IssueAbortIndication
            | Action::IssueDataIndication
            | Action::IssueReleaseIndication
            | Action::IssueReleaseConfirm => Ok(()),
        }
    }

    fn abort_provider(&mut self, reason: AbortRQServiceProviderReason) {
        let _ = write_pdu(
            &mut self.socket,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(reason),
            },
        );
        let _ = self.socket.shutdown(Shutdown::Both);
        self.state = State::Sta1Idle;
    }
}

impl Drop for ClientAssociation {
    fn drop(&mut self) {
        if self.state == State::Sta6Established {
            let _ = self.release();
        }
    }
}

fn clamp_max_pdu(value: u32) -> u32 {
    if value == 0 {
        // 0 means unlimited, which the implementation caps
        MAXIMUM_PDU_SIZE
    } else {
        value.min(MAXIMUM_PDU_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_max_pdu_handles_unlimited_and_ceiling() {
        assert_eq!(clamp_max_pdu(0), MAXIMUM_PDU_SIZE);
        assert_eq!(clamp_max_pdu(16_384), 16_384);
        assert_eq!(clamp_max_pdu(10_000_000), MAXIMUM_PDU_SIZE);
    }
}
