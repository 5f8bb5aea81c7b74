//! Local signing identity and signer recovery.
//!
//! Signatures are recoverable secp256k1 ECDSA over a 32-byte digest, so a
//! verifier only needs the signer's address, never its public key.

use super::{abi::keccak256, Address, CryptoError, Hash32, Signature};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use std::fmt;

/// Key pair and address of a channel participant
#[derive(Clone)]
pub struct Identity {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
}

impl Identity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret_key(secret_key)
    }

    /// Restore an identity from its 32-byte secret
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_secret_key(secret_key))
    }

    fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
            address: address_of(&public_key),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Export the raw secret, e.g. to key an encrypted messaging room
    pub fn export_secret(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    /// Sign a 32-byte digest
    pub fn sign_hash(&self, hash: &Hash32) -> Signature {
        let secp = Secp256k1::new();
        let message = Message::from_digest(*hash.as_bytes());
        let (recovery_id, compact) = secp
            .sign_ecdsa_recoverable(&message, &self.secret_key)
            .serialize_compact();

        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = 27 + recovery_id.to_i32() as u8;
        Signature::from_bytes(bytes)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.address)
    }
}

/// Address of a public key: last 20 bytes of keccak(uncompressed key without prefix)
pub fn address_of(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest.as_bytes()[12..]);
    Address::from_bytes(address)
}

/// Recover the address that produced `signature` over `hash`
pub fn recover_signer(hash: &Hash32, signature: &Signature) -> Result<Address, CryptoError> {
    let bytes = signature.as_bytes();
    let v = bytes[64];
    let recovery = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_i32(i32::from(recovery))
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    let recoverable = RecoverableSignature::from_compact(&bytes[..64], recovery_id)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;

    let secp = Secp256k1::new();
    let message = Message::from_digest(*hash.as_bytes());
    let public_key = secp
        .recover_ecdsa(&message, &recoverable)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    Ok(address_of(&public_key))
}

/// True when `signature` over `hash` was produced by `address`
pub fn verify_signer(hash: &Hash32, signature: &Signature, address: &Address) -> Result<bool, CryptoError> {
    Ok(recover_signer(hash, signature)? == *address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::abi::{keccak_packed, Token};

    #[test]
    fn test_sign_and_recover() {
        let identity = Identity::generate();
        let hash = keccak256(b"channel state");
        let signature = identity.sign_hash(&hash);

        assert_eq!(recover_signer(&hash, &signature).unwrap(), identity.address());
        assert!(verify_signer(&hash, &signature, &identity.address()).unwrap());
    }

    #[test]
    fn test_tampered_field_fails_verification() {
        let identity = Identity::generate();
        let channel_id = [3u8; 32];
        let signed = keccak_packed(&[Token::Bytes32(&channel_id), Token::Uint(100), Token::Uint(7)]);
        let tampered = keccak_packed(&[Token::Bytes32(&channel_id), Token::Uint(101), Token::Uint(7)]);
        let signature = identity.sign_hash(&signed);

        assert!(!verify_signer(&tampered, &signature, &identity.address()).unwrap());
    }

    #[test]
    fn test_other_signer_rejected() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let hash = keccak256(b"close");
        let signature = mallory.sign_hash(&hash);

        assert!(!verify_signer(&hash, &signature, &alice.address()).unwrap());
    }

    #[test]
    fn test_secret_roundtrip_keeps_address() {
        let identity = Identity::generate();
        let restored = Identity::from_secret_bytes(&identity.export_secret()).unwrap();
        assert_eq!(identity.address(), restored.address());
    }

    #[test]
    fn test_garbage_signature_is_malformed() {
        let mut bytes = [0u8; 65];
        bytes[64] = 40;
        let result = recover_signer(&keccak256(b"x"), &Signature::from_bytes(bytes));
        assert!(matches!(result, Err(CryptoError::MalformedSignature(_))));
    }
}
