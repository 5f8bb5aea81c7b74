//! Packed keccak-256 hashing of typed tuples.
//!
//! Every signed message in the channel protocol is the keccak-256 digest of
//! the tightly packed encoding of a fixed, ordered tuple. The encoding
//! matches what the ledger contract recomputes on-chain:
//!
//! | type      | encoding                              |
//! |-----------|---------------------------------------|
//! | `bytes32` | 32 raw bytes                          |
//! | `address` | 20 raw bytes                          |
//! | `uint`    | 32-byte big-endian                    |
//! | `uint[]`  | each element as 32-byte big-endian    |
//! | `bytes`   | raw bytes, no length prefix           |
//! | `bool`    | one byte, `0x01` or `0x00`            |

use super::{Address, Hash32};
use sha3::{Digest, Keccak256};

/// A typed value in a hashed tuple
#[derive(Clone, Copy, Debug)]
pub enum Token<'a> {
    Bytes32(&'a [u8; 32]),
    Address(&'a Address),
    Uint(u128),
    UintArray(&'a [u64]),
    Bytes(&'a [u8]),
    Bool(bool),
}

impl Token<'_> {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Token::Bytes32(bytes) => out.extend_from_slice(&bytes[..]),
            Token::Address(address) => out.extend_from_slice(address.as_bytes()),
            Token::Uint(value) => out.extend_from_slice(&uint256(*value)),
            Token::UintArray(values) => {
                for value in values.iter() {
                    out.extend_from_slice(&uint256(u128::from(*value)));
                }
            }
            Token::Bytes(bytes) => out.extend_from_slice(bytes),
            Token::Bool(flag) => out.push(u8::from(*flag)),
        }
    }
}

fn uint256(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Packed encoding of a tuple
pub fn encode_packed(tokens: &[Token<'_>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tokens.len() * 32);
    for token in tokens {
        token.encode_into(&mut out);
    }
    out
}

/// keccak-256 of the packed encoding of a tuple
pub fn keccak_packed(tokens: &[Token<'_>]) -> Hash32 {
    keccak256(&encode_packed(tokens))
}

/// Plain keccak-256
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash32::from_bytes(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_is_left_padded() {
        let encoded = encode_packed(&[Token::Uint(0x0102)]);
        assert_eq!(encoded.len(), 32);
        assert_eq!(&encoded[30..], &[0x01, 0x02]);
        assert!(encoded[..30].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_packed_layout() {
        let id = [9u8; 32];
        let address = Address::from_bytes([1u8; 20]);
        let encoded = encode_packed(&[
            Token::Bytes32(&id),
            Token::Address(&address),
            Token::UintArray(&[1, 2]),
            Token::Bytes(&[0xaa, 0xbb]),
            Token::Bool(true),
        ]);
        assert_eq!(encoded.len(), 32 + 20 + 64 + 2 + 1);
        assert_eq!(*encoded.last().unwrap(), 1);
    }

    #[test]
    fn test_keccak_known_vector() {
        // keccak256("") from the Ethereum yellow paper
        assert_eq!(
            keccak256(b"").to_hex(),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_field_order_matters() {
        let a = keccak_packed(&[Token::Uint(1), Token::Uint(2)]);
        let b = keccak_packed(&[Token::Uint(2), Token::Uint(1)]);
        assert_ne!(a, b);
    }
}
