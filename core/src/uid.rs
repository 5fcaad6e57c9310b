//! Validated unique identifiers.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use snafu::{ensure, Snafu};

/// The maximum number of characters in a UID.
pub const UID_MAX_LENGTH: usize = 64;

#[derive(Debug, Snafu, PartialEq)]
#[non_exhaustive]
pub enum InvalidUid {
    /// UID is empty
    Empty,

    #[snafu(display("UID has {} characters, maximum is 64", length))]
    TooLong { length: usize },

    #[snafu(display("UID component {} is empty", index))]
    EmptyComponent { index: usize },

    #[snafu(display("UID component {} has a leading zero", index))]
    LeadingZero { index: usize },

    #[snafu(display("UID contains a character other than digits and dots"))]
    IllegalCharacter,
}

/// A validated DICOM unique identifier in dotted decimal form.
///
/// Each dot-separated component is a non-empty decimal number
/// without leading zeros (a single `0` component is allowed),
/// and the whole identifier is at most 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid(String);

impl Uid {
    /// Validate the given characters as a UID.
    ///
    /// Trailing NUL padding from wire values is removed before validation.
    pub fn new(value: impl AsRef<str>) -> Result<Self, InvalidUid> {
        let value = trim_uid(Cow::Borrowed(value.as_ref()));
        ensure!(!value.is_empty(), EmptySnafu);
        ensure!(
            value.len() <= UID_MAX_LENGTH,
            TooLongSnafu {
                length: value.len()
            }
        );
        for (index, component) in value.split('.').enumerate() {
            ensure!(!component.is_empty(), EmptyComponentSnafu { index });
            ensure!(
                component.bytes().all(|b| b.is_ascii_digit()),
                IllegalCharacterSnafu
            );
            ensure!(
                component.len() == 1 || !component.starts_with('0'),
                LeadingZeroSnafu { index }
            );
        }
        Ok(Uid(value.into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Uid {
    type Err = InvalidUid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uid::new(s)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Strip trailing NUL padding (and any whitespace before it)
/// from a UID obtained off the wire.
pub fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with('\0') {
        Cow::Owned(
            uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string(),
        )
    } else {
        uid
    }
}
