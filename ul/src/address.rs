//! Data types for addresses to nodes in DICOM networks.
//!
//! A peer is reachable through a host name and port,
//! and addressed as an application entity through its AE title.
//! The compound syntax `{ae_title}@{host}:{port}` carries both.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError {
    /// Missing `@` in full AE address
    MissingPart,

    /// Missing `:{{port}}` in AE address
    MissingPort,

    /// Could not parse port number
    ParsePort { source: std::num::ParseIntError },
}

/// A full address to a target application entity:
/// an AE title plus a host name and port.
///
/// These addresses can be serialized and parsed
/// with the syntax `{ae_title}@{host}:{port}`.
///
/// # Example
///
/// ```
/// # use dicomnet_ul::FullAeAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "SCP-STORAGE@192.168.1.99:104".parse()?;
/// assert_eq!(addr.ae_title(), "SCP-STORAGE");
/// assert_eq!(addr.host(), "192.168.1.99");
/// assert_eq!(addr.port(), 104);
/// assert_eq!(&addr.to_string(), "SCP-STORAGE@192.168.1.99:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullAeAddr {
    ae_title: String,
    host: String,
    port: u16,
}

impl FullAeAddr {
    /// Create an AE address from its bare constituent parts.
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
        }
    }

    /// Retrieve the application entity title portion.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Retrieve the host name portion.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Retrieve the port number portion.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, addr) = s.split_once('@').context(MissingPartSnafu)?;
        let (host, port) = addr.rsplit_once(':').context(MissingPortSnafu)?;
        Ok(FullAeAddr {
            ae_title: ae_title.to_string(),
            host: host.to_string(),
            port: port.parse().context(ParsePortSnafu)?,
        })
    }
}

impl ToSocketAddrs for FullAeAddr {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

/// An address to a target node
/// in which the application entity title part is optional.
///
/// For the version of the struct with a mandatory AE title,
/// see [`FullAeAddr`].
///
/// # Example
///
/// ```
/// # use dicomnet_ul::{AeAddr, FullAeAddr};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr = "pacs.example.com:1045".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// // the AE title can be provided later
/// let full_addr: FullAeAddr = addr.with_default_ae_title("SCP-QUERY");
/// assert_eq!(full_addr.ae_title(), "SCP-QUERY");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeAddr {
    ae_title: Option<String>,
    host: String,
    port: u16,
}

impl AeAddr {
    /// Create an AE address from its bare constituent parts.
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            host: host.into(),
            port,
        }
    }

    /// Retrieve the application entity title portion, if present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// Retrieve the host name portion.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Retrieve the port number portion.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Create a full address with the given AE title,
    /// discarding any AE title already present.
    pub fn with_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr {
        FullAeAddr {
            ae_title: ae_title.into(),
            host: self.host,
            port: self.port,
        }
    }

    /// Create a full address,
    /// using the given AE title only if one is missing.
    pub fn with_default_ae_title(self, ae_title: impl Into<String>) -> FullAeAddr {
        FullAeAddr {
            ae_title: self.ae_title.unwrap_or_else(|| ae_title.into()),
            host: self.host,
            port: self.port,
        }
    }
}

impl From<FullAeAddr> for AeAddr {
    fn from(full: FullAeAddr) -> Self {
        AeAddr {
            ae_title: Some(full.ae_title),
            host: full.host,
            port: full.port,
        }
    }
}

impl FromStr for AeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, addr) = match s.split_once('@') {
            Some((ae_title, addr)) => (Some(ae_title.to_string()), addr),
            None => (None, s),
        };
        let (host, port) = addr.rsplit_once(':').context(MissingPortSnafu)?;
        Ok(AeAddr {
            ae_title,
            host: host.to_string(),
            port: port.parse().context(ParsePortSnafu)?,
        })
    }
}

impl ToSocketAddrs for AeAddr {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            write!(f, "{}@", ae_title)?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_ae_addr() {
        let addr: FullAeAddr = "STORE-SCP@127.0.0.1:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), "STORE-SCP");
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.port(), 11112);
        assert_eq!(addr.to_string(), "STORE-SCP@127.0.0.1:11112");
    }

    #[test]
    fn full_ae_addr_requires_both_parts() {
        assert_eq!(
            "127.0.0.1:104".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::MissingPart)
        );
        assert_eq!(
            "SCP@127.0.0.1".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::MissingPort)
        );
    }

    #[test]
    fn ae_addr_title_is_optional() {
        let addr: AeAddr = "pacs.example.com:104".parse().unwrap();
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.host(), "pacs.example.com");

        let addr: AeAddr = "ARCHIVE@pacs.example.com:104".parse().unwrap();
        assert_eq!(addr.ae_title(), Some("ARCHIVE"));
        let full = addr.with_default_ae_title("ANY-SCP");
        assert_eq!(full.ae_title(), "ARCHIVE");
    }
}
