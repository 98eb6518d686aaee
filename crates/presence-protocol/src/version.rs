//! Protocol versioning.
//!
//! Only the major version travels on the wire; relays with different major
//! versions refuse each other's frames.

use std::fmt;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Bumped on wire-incompatible changes.
    pub major: u8,
    /// Bumped on additive changes such as new optional payload fields.
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check whether a frame stamped with `major` can be read by this version.
    #[must_use]
    pub fn accepts(&self, major: u8) -> bool {
        self.major == major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
