//! DICOM association module
//!
//! This module contains the runtime which establishes associations
//! between DICOM nodes via TCP/IP
//! and exchanges DIMSE messages over them,
//! on behalf of a service class user.
//!
//! See [`client::ClientAssociationOptions`]
//! for the entry point to requesting an association.

pub mod client;

pub use client::{ClientAssociation, ClientAssociationOptions, NegotiatedContext};
