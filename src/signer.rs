//! Signing capability: the holder of the user's key material.

use anyhow::{Context, Result};
use async_trait::async_trait;
use secp256k1::{All, Keypair, Message, Secp256k1};

use crate::{
    error::SignerError,
    event::{event_hash, Event, EventDraft, Identity, RelayMap},
};

/// Produces the user's identity, relay list and signatures.
///
/// Each call may wait on user approval and may be refused.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn get_public_key(&self) -> Result<Identity, SignerError>;
    async fn get_relays(&self) -> Result<RelayMap, SignerError>;
    async fn sign_event(&self, draft: EventDraft) -> Result<Event, SignerError>;
}

/// Signer backed by a local secp256k1 secret key.
pub struct KeySigner {
    secp: Secp256k1<All>,
    keypair: Keypair,
    relays: RelayMap,
}

impl KeySigner {
    /// Build from a 32-byte hex secret key.
    pub fn from_hex(secret: &str, relays: RelayMap) -> Result<Self> {
        let bytes = hex::decode(secret.trim()).context("secret key is not hex")?;
        let secp = Secp256k1::new();
        let keypair =
            Keypair::from_seckey_slice(&secp, &bytes).context("invalid secret key")?;
        Ok(Self {
            secp,
            keypair,
            relays,
        })
    }

    pub fn public_key_hex(&self) -> Identity {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }
}

#[async_trait]
impl Signer for KeySigner {
    async fn get_public_key(&self) -> Result<Identity, SignerError> {
        Ok(self.public_key_hex())
    }

    async fn get_relays(&self) -> Result<RelayMap, SignerError> {
        Ok(self.relays.clone())
    }

    async fn sign_event(&self, draft: EventDraft) -> Result<Event, SignerError> {
        let mut ev = draft.into_event(self.public_key_hex());
        let hash = event_hash(&ev).map_err(|e| SignerError::Failed(e.to_string()))?;
        let msg =
            Message::from_digest_slice(&hash).map_err(|e| SignerError::Failed(e.to_string()))?;
        let aux: [u8; 32] = rand::random();
        let sig = self
            .secp
            .sign_schnorr_with_aux_rand(&msg, &self.keypair, &aux);
        ev.id = hex::encode(hash);
        ev.sig = sig.to_string();
        Ok(ev)
    }
}

/// Stand-in used when no key is configured: every request is refused, the
/// same way a page without a signing extension behaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSigner;

#[async_trait]
impl Signer for NoSigner {
    async fn get_public_key(&self) -> Result<Identity, SignerError> {
        Err(SignerError::Unavailable)
    }

    async fn get_relays(&self) -> Result<RelayMap, SignerError> {
        Err(SignerError::Unavailable)
    }

    async fn sign_event(&self, _draft: EventDraft) -> Result<Event, SignerError> {
        Err(SignerError::Unavailable)
    }
}
