mod command;
pub(crate) use command::Command;

pub(crate) mod fragment;

use std::{fmt, num::ParseIntError, str::FromStr};

/// Identifier handed out by the controller on registration.
///
/// Every streaming fragment carries it as a little-endian prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DetectorId(pub u32);

impl DetectorId {
    pub const fn prefix(self) -> [u8; fragment::PREFIX_LEN] {
        self.0.to_le_bytes()
    }

    #[allow(dead_code)]
    pub const fn from_prefix(prefix: [u8; fragment::PREFIX_LEN]) -> Self {
        Self(u32::from_le_bytes(prefix))
    }
}

impl FromStr for DetectorId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
