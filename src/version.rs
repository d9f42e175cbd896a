//! Module with HTTP version related types.

use std::fmt;
use std::str::FromStr;

/// HTTP version.
///
/// RFC 7231 section 2.6.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0.
    ///
    /// RFC 1945.
    Http10,
    /// HTTP/1.1.
    ///
    /// RFC 7230.
    Http11,
}

impl Version {
    /// Map the minor version as returned by [`httparse`] to a `Version`.
    ///
    /// Unknown minor versions are downgraded to HTTP/1.0, the version with the
    /// fewest assumptions about the connection.
    pub(crate) const fn from_minor(minor: u8) -> Version {
        match minor {
            1 => Version::Http11,
            _ => Version::Http10,
        }
    }

    /// Returns the major version.
    pub const fn major(self) -> u8 {
        match self {
            Version::Http10 | Version::Http11 => 1,
        }
    }

    /// Returns the minor version.
    pub const fn minor(self) -> u8 {
        match self {
            Version::Http10 => 0,
            Version::Http11 => 1,
        }
    }

    /// Returns the version as string, e.g. `HTTP/1.1`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the [`FromStr`] implementation for [`Version`].
#[derive(Copy, Clone, Debug)]
pub struct UnknownVersion;

impl fmt::Display for UnknownVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown HTTP version")
    }
}

impl std::error::Error for UnknownVersion {}

impl FromStr for Version {
    type Err = UnknownVersion;

    /// Accepts both the full (`HTTP/1.1`) and the short (`1.1`) form.
    fn from_str(version: &str) -> Result<Self, Self::Err> {
        match version {
            "HTTP/1.0" | "1.0" => Ok(Version::Http10),
            "HTTP/1.1" | "1.1" => Ok(Version::Http11),
            _ => Err(UnknownVersion),
        }
    }
}
