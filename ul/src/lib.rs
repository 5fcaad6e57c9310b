//! Types and methods for interacting with DICOM nodes
//! through the upper layer protocol.
//!
//! - The [`address`] module
//!   provides an abstraction for working with compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and the functions to read and write them.
//! - The [`command`] module
//!   provides the DIMSE command set codec
//!   (group 0000, Implicit VR Little Endian).
//! - The [`pdata`] module
//!   reassembles presentation data values into whole messages
//!   and fragments outbound messages under the negotiated maximum PDU size.
//! - The [`machine`] module
//!   implements the upper layer state machine
//!   as a pure transition function over states Sta1 through Sta13.
//! - The [`association`] module
//!   drives the state machine over a TCP transport
//!   on behalf of a service class user.

pub mod address;
pub mod association;
pub mod command;
pub mod machine;
pub mod pdata;
pub mod pdu;

/// The implementation class UID generically referring to this stack.
///
/// Automatically generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828605291771739347441643839319522176";

/// The implementation version name generically referring to this stack.
pub const IMPLEMENTATION_VERSION_NAME: &str = "dicomnet 0.1.0";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use command::CommandSet;
pub use pdata::AssembledMessage;
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
