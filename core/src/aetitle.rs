//! Validated application entity titles.

use std::fmt;
use std::str::FromStr;

use snafu::{ensure, Snafu};

/// The number of bytes an AE title occupies on the wire.
pub const AE_TITLE_WIDTH: usize = 16;

#[derive(Debug, Snafu, PartialEq)]
#[non_exhaustive]
pub enum InvalidAeTitle {
    /// AE title is empty or all spaces
    Empty,

    #[snafu(display("AE title has {} significant characters, maximum is 16", length))]
    TooLong { length: usize },

    #[snafu(display("AE title contains illegal byte 0x{:02X} at position {}", byte, position))]
    IllegalCharacter { byte: u8, position: usize },
}

/// A validated application entity title.
///
/// AE titles are between 1 and 16 significant characters long,
/// made of printable ASCII excluding backslash (`\`).
/// Leading and trailing spaces are not significant:
/// two titles compare equal after trimming,
/// and parsing always stores the trimmed form.
/// On the wire, titles are padded with trailing spaces
/// to exactly 16 bytes.
///
/// # Example
///
/// ```
/// # use dicomnet_core::AeTitle;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let ae: AeTitle = "STORE-SCP ".parse()?;
/// assert_eq!(ae.as_str(), "STORE-SCP");
/// assert_eq!(&ae.to_dicom_padded()[..], b"STORE-SCP       ");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeTitle(String);

impl AeTitle {
    /// Validate and normalize the given characters into an AE title.
    pub fn new(value: impl AsRef<str>) -> Result<Self, InvalidAeTitle> {
        let trimmed = value.as_ref().trim_matches(' ');
        ensure!(!trimmed.is_empty(), EmptySnafu);
        ensure!(
            trimmed.len() <= AE_TITLE_WIDTH,
            TooLongSnafu {
                length: trimmed.len()
            }
        );
        for (position, byte) in trimmed.bytes().enumerate() {
            ensure!(
                (0x20..=0x7E).contains(&byte) && byte != b'\\',
                IllegalCharacterSnafu { byte, position }
            );
        }
        Ok(AeTitle(trimmed.to_string()))
    }

    /// The trimmed, significant characters of the title.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The wire form of the title:
    /// exactly 16 bytes, padded with trailing spaces.
    pub fn to_dicom_padded(&self) -> [u8; AE_TITLE_WIDTH] {
        let mut out = [b' '; AE_TITLE_WIDTH];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }
}

impl FromStr for AeTitle {
    type Err = InvalidAeTitle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AeTitle::new(s)
    }
}

impl fmt::Display for AeTitle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AeTitle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for AeTitle {
    type Error = InvalidAeTitle;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        AeTitle::new(value)
    }
}
