//! Fixed-size byte types shared by the channel protocol and the ledger.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hex (de)serialization for fixed-size byte arrays, `0x` prefixed.
pub mod hex_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        format!("0x{}", hex::encode(bytes)).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let hex_str = String::deserialize(d)?;
        let bytes = hex::decode(hex_str.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes, got {}", N, len)))
    }
}

/// Hex (de)serialization for variable-length byte strings, `0x` prefixed.
pub mod hex_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        format!("0x{}", hex::encode(bytes)).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let hex_str = String::deserialize(d)?;
        hex::decode(hex_str.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

/// Error returned when parsing a hex-encoded value fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hex value: {0}")]
pub struct ParseHexError(String);

fn parse_fixed<const N: usize>(s: &str) -> Result<[u8; N], ParseHexError> {
    let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|e| ParseHexError(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ParseHexError(format!("expected {} bytes, got {}", N, len)))
}

macro_rules! bytes32_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(#[serde(with = "hex_array")] [u8; 32]);

        impl $name {
            /// Create from raw bytes
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the underlying bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// `0x` prefixed hex encoding
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// True when every byte is zero
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..8]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = ParseHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_fixed(s).map(Self)
            }
        }
    };
}

bytes32_type!(
    /// keccak-256 / sha-256 digest
    Hash32
);

bytes32_type!(
    /// Channel identifier, freshly generated by the player for each channel
    ChannelId
);

bytes32_type!(
    /// Per-round random seed chosen by the player
    Seed
);

bytes32_type!(
    /// Ledger transaction hash
    TxHash
);

impl ChannelId {
    /// Create a new random channel id
    pub fn random() -> Self {
        Self(random_bytes())
    }
}

impl Seed {
    /// Create a new random seed
    pub fn random() -> Self {
        Self(random_bytes())
    }
}

impl TxHash {
    /// Create a random transaction hash (used by mock ledgers)
    pub fn random() -> Self {
        Self(random_bytes())
    }
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// 20-byte account address (last 20 bytes of keccak(pubkey))
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(#[serde(with = "hex_array")] [u8; 20]);

impl Address {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Get the underlying bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = ParseHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s).map(Self)
    }
}

/// 65-byte recoverable ECDSA signature laid out as r || s || v, v in {27, 28}
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(#[serde(with = "hex_array")] [u8; 65]);

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    /// Get the underlying bytes
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}
