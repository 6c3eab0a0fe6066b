// ── Identity types ──
//
// Registry identifiers are plain integers assigned by the database. Zones
// and devices reference each other by id, never by pointer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

row_id!(
    /// Generated identifier of a registered device.
    DeviceId
);

row_id!(
    /// Identifier of a zone (local row id, not the cloud zone id).
    ZoneId
);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let id: DeviceId = " 42 ".parse().unwrap();
        assert_eq!(id, DeviceId(42));
        assert_eq!(id.to_string(), "42");
        assert!("kitchen".parse::<ZoneId>().is_err());
    }

    #[test]
    fn serializes_transparently() {
        assert_eq!(serde_json::to_string(&DeviceId(7)).unwrap(), "7");
        let z: ZoneId = serde_json::from_str("3").unwrap();
        assert_eq!(z, ZoneId(3));
    }
}
