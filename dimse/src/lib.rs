//! DIMSE services for a service class user.
//!
//! This crate layers the DICOM message service element
//! on top of the upper layer protocol:
//!
//! - The [`message`] module classifies assembled messages
//!   into the DIMSE message types
//!   and builds the request command sets.
//! - The [`identifier`] module holds query identifiers
//!   and the seams to external data set collaborators.
//! - The [`scu`] module drives the C-ECHO, C-STORE, C-FIND,
//!   C-MOVE, C-GET and C-CANCEL request/response flows
//!   over an established association.

pub mod identifier;
pub mod message;
pub mod scu;

pub use identifier::{FlatIdentifier, InformationModel, QueryRetrieveLevel};
pub use message::{CommandField, DimseMessage, Priority, StatusClass, SubOperations};
pub use scu::ServiceUser;
