//! Signing and verification on a dedicated thread.
//!
//! The worker owns the local identity and the counterparty's RSA verifier
//! key. Callers talk to it only through request/reply messages, so key
//! material never leaves the thread except through `export_secret`, which
//! the private-room handshake needs.

use paychannel_core::crypto::verify_signer;
use paychannel_core::{Address, CryptoError, Hash32, Identity, Signature, VerifierKey};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum CryptoRequest {
    SignHash {
        hash: Hash32,
        reply: oneshot::Sender<Signature>,
    },
    VerifySignature {
        hash: Hash32,
        signature: Signature,
        signer: Address,
        reply: oneshot::Sender<Result<bool, CryptoError>>,
    },
    LoadVerifierKey {
        key: VerifierKey,
        reply: oneshot::Sender<Result<(), CryptoError>>,
    },
    VerifyWithLoadedKey {
        hash: Hash32,
        signature: Vec<u8>,
        reply: oneshot::Sender<Result<bool, CryptoError>>,
    },
    ExportSecret {
        reply: oneshot::Sender<[u8; 32]>,
    },
}

/// Handle to the crypto thread; cheap to clone
///
/// The thread exits once every handle is dropped.
#[derive(Clone)]
pub struct CryptoWorker {
    requests: mpsc::UnboundedSender<CryptoRequest>,
    address: Address,
}

impl CryptoWorker {
    pub fn spawn(identity: Identity) -> Result<Self, CryptoError> {
        let address = identity.address();
        let (requests, inbox) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("paychannel-crypto".to_string())
            .spawn(move || run(identity, inbox))
            .map_err(|_| CryptoError::WorkerUnavailable)?;
        debug!(address = %address, "crypto worker started");
        Ok(Self { requests, address })
    }

    /// Address of the identity the worker signs with
    pub fn address(&self) -> Address {
        self.address
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CryptoRequest,
    ) -> Result<T, CryptoError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| CryptoError::WorkerUnavailable)?;
        response.await.map_err(|_| CryptoError::WorkerUnavailable)
    }

    pub async fn sign_hash(&self, hash: Hash32) -> Result<Signature, CryptoError> {
        self.call(|reply| CryptoRequest::SignHash { hash, reply }).await
    }

    /// True when `signature` over `hash` recovers to `signer`
    pub async fn verify_signature(
        &self,
        hash: Hash32,
        signature: Signature,
        signer: Address,
    ) -> Result<bool, CryptoError> {
        self.call(|reply| CryptoRequest::VerifySignature {
            hash,
            signature,
            signer,
            reply,
        })
        .await?
    }

    /// Install the counterparty's RSA key for later randomness checks
    pub async fn load_verifier_key(&self, key: VerifierKey) -> Result<(), CryptoError> {
        self.call(|reply| CryptoRequest::LoadVerifierKey { key, reply })
            .await?
    }

    /// Check an RSA PKCS#1 v1.5 signature over the raw `hash`
    pub async fn verify_with_loaded_key(
        &self,
        hash: Hash32,
        signature: Vec<u8>,
    ) -> Result<bool, CryptoError> {
        self.call(|reply| CryptoRequest::VerifyWithLoadedKey {
            hash,
            signature,
            reply,
        })
        .await?
    }

    /// Raw secret key, used to authenticate to private rooms
    pub async fn export_secret(&self) -> Result<[u8; 32], CryptoError> {
        self.call(|reply| CryptoRequest::ExportSecret { reply }).await
    }
}

fn run(identity: Identity, mut inbox: mpsc::UnboundedReceiver<CryptoRequest>) {
    let mut verifier: Option<RsaPublicKey> = None;

    while let Some(request) = inbox.blocking_recv() {
        match request {
            CryptoRequest::SignHash { hash, reply } => {
                let _ = reply.send(identity.sign_hash(&hash));
            }
            CryptoRequest::VerifySignature {
                hash,
                signature,
                signer,
                reply,
            } => {
                let _ = reply.send(verify_signer(&hash, &signature, &signer));
            }
            CryptoRequest::LoadVerifierKey { key, reply } => {
                let result = rsa_public_key(&key).map(|key| {
                    verifier = Some(key);
                });
                let _ = reply.send(result);
            }
            CryptoRequest::VerifyWithLoadedKey {
                hash,
                signature,
                reply,
            } => {
                let result = match &verifier {
                    Some(key) => Ok(key
                        .verify(Pkcs1v15Sign::new_unprefixed(), hash.as_bytes(), &signature)
                        .is_ok()),
                    None => Err(CryptoError::NoVerifierKey),
                };
                let _ = reply.send(result);
            }
            CryptoRequest::ExportSecret { reply } => {
                let _ = reply.send(identity.export_secret());
            }
        }
    }
    debug!("crypto worker stopped");
}

fn rsa_public_key(key: &VerifierKey) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::new(
        BigUint::from_bytes_be(&key.modulus),
        BigUint::from_bytes_be(&key.exponent),
    )
    .map_err(|e| {
        warn!(key = ?key, error = %e, "rejected verifier key");
        CryptoError::InvalidKey(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bankroller::shared_rsa_key;
    use paychannel_core::crypto::keccak256;
    use rsa::traits::PublicKeyParts;

    fn verifier_key(key: &rsa::RsaPrivateKey) -> VerifierKey {
        VerifierKey {
            modulus: key.n().to_bytes_be(),
            exponent: key.e().to_bytes_be(),
        }
    }

    #[tokio::test]
    async fn test_sign_and_verify_roundtrip() {
        let identity = Identity::generate();
        let worker = CryptoWorker::spawn(identity.clone()).unwrap();
        let hash = keccak256(b"round");

        let signature = worker.sign_hash(hash).await.unwrap();

        assert!(worker
            .verify_signature(hash, signature, identity.address())
            .await
            .unwrap());
        assert!(!worker
            .verify_signature(keccak256(b"other"), signature, identity.address())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_verify_rejects_other_signer() {
        let worker = CryptoWorker::spawn(Identity::generate()).unwrap();
        let stranger = Identity::generate();
        let hash = keccak256(b"state");

        let signature = stranger.sign_hash(&hash);

        assert!(!worker
            .verify_signature(hash, signature, worker.address())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rsa_verification_needs_loaded_key() {
        let worker = CryptoWorker::spawn(Identity::generate()).unwrap();
        let result = worker
            .verify_with_loaded_key(keccak256(b"x"), vec![0; 128])
            .await;
        assert!(matches!(result, Err(CryptoError::NoVerifierKey)));
    }

    #[tokio::test]
    async fn test_rsa_verification() {
        let private = shared_rsa_key().unwrap();
        let worker = CryptoWorker::spawn(Identity::generate()).unwrap();
        worker.load_verifier_key(verifier_key(&private)).await.unwrap();

        let hash = keccak256(b"round hash");
        let mut signature = private
            .sign(Pkcs1v15Sign::new_unprefixed(), hash.as_bytes())
            .unwrap();

        assert!(worker
            .verify_with_loaded_key(hash, signature.clone())
            .await
            .unwrap());

        signature[10] ^= 0x01;
        assert!(!worker.verify_with_loaded_key(hash, signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_verifier_key_is_rejected() {
        let worker = CryptoWorker::spawn(Identity::generate()).unwrap();
        let result = worker
            .load_verifier_key(VerifierKey {
                modulus: vec![0x0f],
                exponent: vec![1],
            })
            .await;
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_export_secret_matches_identity() {
        let identity = Identity::generate();
        let worker = CryptoWorker::spawn(identity.clone()).unwrap();
        assert_eq!(worker.export_secret().await.unwrap(), identity.export_secret());
    }
}
