//! Binary primitives and identifiers shared by the dicomnet crates.
//!
//! This crate holds the value types that appear on the wire
//! in the DICOM upper layer protocol and in DIMSE command sets:
//!
//! - The [`tag`] module provides the [`Tag`] type
//!   and constants for the attributes this stack routes on.
//! - The [`vr`] module provides the [`VR`] table
//!   with the properties needed by explicit-VR encoding.
//! - The [`aetitle`] module provides validated
//!   application entity titles ([`AeTitle`]).
//! - The [`uid`] module provides validated unique identifiers ([`Uid`]).
//! - The [`uids`] module provides the well-known UIDs
//!   recognized by name.

pub mod aetitle;
pub mod tag;
pub mod uid;
pub mod uids;
pub mod vr;

pub use aetitle::AeTitle;
pub use tag::Tag;
pub use uid::{trim_uid, Uid};
pub use vr::VR;
