//! Fixed-width identifiers used on the wire.
//!
//! Node, message and group identifiers are 16 raw bytes on the wire and in the
//! signing input (see `codec::envelope`). `Uuid` is kept only as a display and
//! interop form at the API boundary; nothing downstream of the codec parses
//! the hyphenated text representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! fixed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub [u8; 16]);

        impl $name {
            pub fn new_random() -> Self {
                Self(*Uuid::new_v4().as_bytes())
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", Uuid::from_bytes(self.0))
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(*Uuid::parse_str(s)?.as_bytes()))
            }
        }
    };
}

fixed_id!(NodeId);
fixed_id!(MessageId);
fixed_id!(GroupId);
