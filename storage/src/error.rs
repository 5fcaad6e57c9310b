//! The user-facing error taxonomy.
//!
//! Every error has a category and a retryability flag;
//! the retry executor consults only the flag,
//! while the recovery hint is meant for the human
//! (or the operator tooling) behind the caller.

use std::time::Duration;

use snafu::Snafu;

use dicomnet_ul::pdu::{AbortRQSource, AssociationRJResult, AssociationRJSource};

/// Which of the configured timeouts expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Connect,
    Read,
    Write,
    /// the total time budget of one operation
    Operation,
    /// the association (ARTIM) timer
    Association,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Read => "read",
            TimeoutKind::Write => "write",
            TimeoutKind::Operation => "operation",
            TimeoutKind::Association => "association",
        };
        f.write_str(name)
    }
}

/// The broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transient,
    Timeout,
    Protocol,
    Configuration,
    Permanent,
    Resource,
}

/// What the caller can do about a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryHint {
    Retry,
    RetryWithBackoff { initial: Duration },
    WaitAndRetry { duration: Duration },
    CheckConfiguration { details: String },
    UseAlternateServer,
    NoRecovery { reason: String },
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not open a connection to the peer
    ConnectionFailed { source: std::io::Error },

    #[snafu(display("{} timeout expired", kind))]
    Timeout { kind: TimeoutKind },

    #[snafu(display("received a malformed PDU: {}", message))]
    InvalidPdu { message: String },

    #[snafu(display("PDU of {} bytes exceeds the configured ceiling of {}", length, ceiling))]
    PduTooLarge { length: u32, ceiling: u32 },

    #[snafu(display("received an unexpected PDU: {}", description))]
    UnexpectedPduType { description: String },

    /// the association was rejected by the peer
    AssociationRejected {
        result: AssociationRJResult,
        rejection_source: AssociationRJSource,
    },

    /// the association was aborted
    AssociationAborted { abort_source: AbortRQSource },

    /// the peer accepted none of the proposed presentation contexts
    NoPresentationContextAccepted,

    #[snafu(display("SOP class {} is not supported by the peer", uid))]
    SopClassNotSupported { uid: String },

    /// invalid application entity title
    InvalidAeTitle {
        source: dicomnet_core::aetitle::InvalidAeTitle,
    },

    /// the connection was closed by the peer
    ConnectionClosed,

    #[snafu(display("invalid state: {}", message))]
    InvalidState { message: String },

    #[snafu(display("could not encode outgoing data: {}", message))]
    EncodingFailed { message: String },

    #[snafu(display("could not decode incoming data: {}", message))]
    DecodingFailed { message: String },

    #[snafu(display("query failed with status 0x{:04X}", status))]
    QueryFailed { status: u16 },

    #[snafu(display("retrieve failed with status 0x{:04X}", status))]
    RetrieveFailed { status: u16 },

    #[snafu(display("store failed with status 0x{:04X}", status))]
    StoreFailed { status: u16 },

    #[snafu(display("association timer expired after {:?}", timeout))]
    ArtimTimerExpired { timeout: Duration },

    #[snafu(display("circuit breaker is open; retry after {:?}", retry_after))]
    CircuitBreakerOpen { retry_after: Duration },

    #[snafu(display("{} of {} operations failed", failed, failed + succeeded))]
    PartialFailure { succeeded: u32, failed: u32 },

    #[snafu(display("all {} candidate servers failed", attempted))]
    AllServersFailed { attempted: usize },
}

impl Error {
    /// The broad class of this failure.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ConnectionFailed { .. }
            | Error::ConnectionClosed
            | Error::AssociationAborted { .. }
            | Error::PartialFailure { .. } => ErrorCategory::Transient,

            Error::Timeout { .. } | Error::ArtimTimerExpired { .. } => ErrorCategory::Timeout,

            Error::InvalidPdu { .. }
            | Error::UnexpectedPduType { .. }
            | Error::InvalidState { .. }
            | Error::EncodingFailed { .. }
            | Error::DecodingFailed { .. } => ErrorCategory::Protocol,

            Error::PduTooLarge { .. }
            | Error::NoPresentationContextAccepted
            | Error::InvalidAeTitle { .. } => ErrorCategory::Configuration,

            Error::AssociationRejected { result, .. } => match result {
                AssociationRJResult::Transient => ErrorCategory::Transient,
                AssociationRJResult::Permanent => ErrorCategory::Permanent,
            },

            Error::SopClassNotSupported { .. }
            | Error::QueryFailed { .. }
            | Error::RetrieveFailed { .. }
            | Error::StoreFailed { .. }
            | Error::AllServersFailed { .. } => ErrorCategory::Permanent,

            Error::CircuitBreakerOpen { .. } => ErrorCategory::Resource,
        }
    }

    /// Whether an identical attempt may succeed later.
    pub fn retryable(&self) -> bool {
        match self {
            Error::ConnectionFailed { .. }
            | Error::ConnectionClosed
            | Error::AssociationAborted { .. }
            | Error::ArtimTimerExpired { .. }
            | Error::CircuitBreakerOpen { .. }
            | Error::PartialFailure { .. } => true,

            // the operation cap is a hard budget, not a transient condition
            Error::Timeout { kind } => *kind != TimeoutKind::Operation,

            Error::AssociationRejected { result, .. } => {
                *result == AssociationRJResult::Transient
            }

            _ => false,
        }
    }

    /// The suggested course of action for the caller.
    pub fn recovery(&self) -> RecoveryHint {
        match self {
            Error::CircuitBreakerOpen { retry_after } => RecoveryHint::WaitAndRetry {
                duration: *retry_after,
            },
            Error::AssociationRejected {
                result: AssociationRJResult::Transient,
                ..
            } => RecoveryHint::RetryWithBackoff {
                initial: Duration::from_secs(5),
            },
            Error::ConnectionFailed { .. }
            | Error::ConnectionClosed
            | Error::AssociationAborted { .. }
            | Error::PartialFailure { .. } => RecoveryHint::Retry,
            Error::Timeout { kind: TimeoutKind::Operation } => RecoveryHint::NoRecovery {
                reason: "the operation exceeded its total time budget".to_string(),
            },
            Error::Timeout { .. } | Error::ArtimTimerExpired { .. } => {
                RecoveryHint::RetryWithBackoff {
                    initial: Duration::from_secs(1),
                }
            }
            Error::PduTooLarge { .. }
            | Error::NoPresentationContextAccepted
            | Error::InvalidAeTitle { .. } => RecoveryHint::CheckConfiguration {
                details: self.to_string(),
            },
            Error::AllServersFailed { .. } | Error::SopClassNotSupported { .. } => {
                RecoveryHint::UseAlternateServer
            }
            other => RecoveryHint::NoRecovery {
                reason: other.to_string(),
            },
        }
    }
}

impl From<dicomnet_ul::association::client::Error> for Error {
    fn from(error: dicomnet_ul::association::client::Error) -> Self {
        use dicomnet_ul::association::client::Error as Ul;
        match error {
            Ul::Connect { source } | Ul::ResolveAddress { source } => {
                Error::ConnectionFailed { source }
            }
            Ul::ConfigureSocket { source } => Error::ConnectionFailed { source },
            Ul::Timeout { .. } => Error::Timeout {
                kind: TimeoutKind::Read,
            },
            Ul::ArtimExpired { timeout } => Error::ArtimTimerExpired { timeout },
            Ul::Rejected {
                association_result,
                association_source,
            } => Error::AssociationRejected {
                result: association_result,
                rejection_source: association_source,
            },
            Ul::PeerAborted { abort_source } => Error::AssociationAborted { abort_source },
            Ul::PeerReleased => Error::InvalidState {
                message: "peer requested release mid-operation".to_string(),
            },
            Ul::NoAcceptedPresentationContexts | Ul::MissingAbstractSyntax => {
                Error::NoPresentationContextAccepted
            }
            Ul::ConnectionClosed => Error::ConnectionClosed,
            Ul::SendTooLongPdu { length, maximum } => Error::PduTooLarge {
                length: length as u32,
                ceiling: maximum,
            },
            Ul::InvalidState { operation, state } => Error::InvalidState {
                message: format!("operation `{}` in state {:?}", operation, state),
            },
            Ul::ProtocolViolation { state, event } => Error::InvalidState {
                message: format!("event {:?} in state {:?}", event, state),
            },
            Ul::ProtocolVersionMismatch { expected, got } => Error::UnexpectedPduType {
                description: format!(
                    "protocol version mismatch (expected {}, got {})",
                    expected, got
                ),
            },
            Ul::UnexpectedResponse { pdu } => Error::UnexpectedPduType {
                description: pdu.short_description().to_string(),
            },
            Ul::SendRequest { source } | Ul::Send { source } => Error::EncodingFailed {
                message: source.to_string(),
            },
            Ul::Receive { source } => match source {
                dicomnet_ul::pdu::reader::Error::PduTooLarge {
                    pdu_length,
                    max_pdu_length,
                    ..
                } => Error::PduTooLarge {
                    length: pdu_length,
                    ceiling: max_pdu_length,
                },
                other => Error::InvalidPdu {
                    message: other.to_string(),
                },
            },
            Ul::Assemble { source } => Error::InvalidPdu {
                message: source.to_string(),
            },
            Ul::Fragment { source } => Error::EncodingFailed {
                message: source.to_string(),
            },
            other => Error::InvalidState {
                message: other.to_string(),
            },
        }
    }
}

impl From<dicomnet_dimse::scu::Error> for Error {
    fn from(error: dicomnet_dimse::scu::Error) -> Self {
        use dicomnet_dimse::scu::Error as Dimse;
        match error {
            Dimse::Association { source } => Error::from(source),
            Dimse::NoPresentationContext { abstract_syntax } => Error::SopClassNotSupported {
                uid: abstract_syntax,
            },
            Dimse::Identifier { source } => Error::EncodingFailed {
                message: source.to_string(),
            },
            Dimse::Command { source } => Error::DecodingFailed {
                message: source.to_string(),
            },
            Dimse::Classify { source } => Error::DecodingFailed {
                message: source.to_string(),
            },
            Dimse::MissingIdentifierData => Error::DecodingFailed {
                message: "pending response carried no identifier".to_string(),
            },
            Dimse::UnexpectedMessage { field } => Error::UnexpectedPduType {
                description: format!("{:?}", field),
            },
            Dimse::MessageIdMismatch { expected, got } => Error::DecodingFailed {
                message: format!(
                    "response for message {} arrived, expected {}",
                    got, expected
                ),
            },
            Dimse::UnknownStatus { status } => Error::DecodingFailed {
                message: format!("unrecognized status 0x{:04X}", status),
            },
            other => Error::InvalidState {
                message: other.to_string(),
            },
        }
    }
}
