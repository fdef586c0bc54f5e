use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::Error;

/// Service domain a REST or WebSocket call is addressed to.
///
/// Every domain has its own REST base URL and issues its own bullet tokens.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Domain {
    Spot,
    Futures,
    Broker,
}

/// Whether a bullet token grants access to public or private push channels.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    #[default]
    Public,
    Private,
}

impl Channel {
    #[must_use]
    pub const fn is_private(self) -> bool {
        matches!(self, Self::Private)
    }
}

/// Case-insensitive; unknown names are a validation error.
impl FromStr for Domain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "futures" => Ok(Self::Futures),
            "broker" => Ok(Self::Broker),
            _ => Err(Error::validation(format!("unknown domain {s}"))),
        }
    }
}

impl Domain {
    /// Parse a domain name, mapping unknown names to a validation error.
    pub fn parse(name: &str) -> Result<Self, Error> {
        name.parse()
    }
}
