use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Platform identifiers are 64-bit snowflakes. They travel as decimal strings
/// on the wire because JSON numbers lose precision above 2^53, but numeric
/// input is accepted too.
macro_rules! snowflake_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
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
                s.trim().parse::<u64>().map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(SnowflakeVisitor).map(Self)
            }
        }
    };
}

struct SnowflakeVisitor;

impl Visitor<'_> for SnowflakeVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a snowflake as a string or unsigned integer")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::custom(format!("negative snowflake: {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        v.trim()
            .parse()
            .map_err(|_| E::custom(format!("invalid snowflake: {v:?}")))
    }
}

snowflake_id!(UserId);
snowflake_id!(RoomId);
snowflake_id!(CategoryId);
snowflake_id!(GuildId);

const EPHEMERAL_PREFIX: &str = "frag_";

/// Opaque identifier of an ephemeral room: `frag_` followed by the 32 hex
/// digits of a random v4 UUID. The hex part is also embedded in the room's
/// display name.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EphemeralId(String);

impl EphemeralId {
    pub fn new() -> Self {
        Self(format!("{EPHEMERAL_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Rebuild an id from the token found in a room name.
    pub fn from_token(token: &str) -> Self {
        Self(format!("{EPHEMERAL_PREFIX}{}", token.to_ascii_lowercase()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The random part, without the `frag_` prefix.
    pub fn token(&self) -> &str {
        self.0.strip_prefix(EPHEMERAL_PREFIX).unwrap_or(&self.0)
    }
}

impl Default for EphemeralId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EphemeralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EphemeralId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
