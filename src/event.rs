//! Nostr event model, follow-list drafts and event validity checks.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded x-only public key identifying a user.
pub type Identity = String;

/// Kind number of a contact list (follow-list) event.
pub const FOLLOW_LIST_KIND: u32 = 3;

/// Tag type marking a followed profile.
pub const FOLLOW_TAG: &str = "p";

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. A follow list is made of `p` tags:
///
/// - `["p", "<pubkey>"]`
/// - `["p", "<pubkey>", "wss://relay.example", "petname"]`
///
/// Each tag is stored verbatim so relay hints and petnames survive a rewrite of
/// the list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a bare `["p", target]` tag.
    pub fn follow(target: impl Into<String>) -> Self {
        Tag(vec![FOLLOW_TAG.into(), target.into()])
    }

    /// Tag type, e.g. `p` or `e`.
    pub fn kind(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element of the tag.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Target identity if this is a follow tag.
    pub fn follow_target(&self) -> Option<&str> {
        match self.kind() {
            Some(FOLLOW_TAG) => self.value(),
            _ => None,
        }
    }
}

/// Signed Nostr event as produced by a signer and relayed by the pool.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "3bf0...",
///   "kind": 3,
///   "created_at": 1700000000,
///   "tags": [["p", "deadbeef"]],
///   "content": "{\"wss://relay.example\":{\"read\":true,\"write\":true}}",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, `3` for follow lists.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Tags; `p` entries for a follow list.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Unsigned event handed to a signer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventDraft {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl EventDraft {
    /// Replacement follow-list event carrying `relays` as its content.
    pub fn follow_list(
        tags: Vec<Tag>,
        relays: &RelayMap,
        created_at: u64,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            kind: FOLLOW_LIST_KIND,
            created_at,
            tags,
            content: relays.to_json()?,
        })
    }

    /// Attach an author, leaving `id` and `sig` empty.
    pub fn into_event(self, pubkey: impl Into<String>) -> Event {
        Event {
            id: String::new(),
            pubkey: pubkey.into(),
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig: String::new(),
        }
    }
}

/// Relay URL to per-relay policy, e.g. `{"wss://r": {"read": true, "write": true}}`.
///
/// The policy value is kept opaque so whatever the signer or a previous client
/// wrote is carried through unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RelayMap(pub BTreeMap<String, Value>);

impl RelayMap {
    /// Map each URL to a read/write policy.
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RelayMap(
            urls.into_iter()
                .map(|u| (u.into(), serde_json::json!({"read": true, "write": true})))
                .collect(),
        )
    }

    /// Endpoint URLs, derived from the map keys.
    pub fn urls(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn from_json(data: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Structural check: hex fields have the right shape and no tag is empty.
pub fn validate_event(ev: &Event) -> bool {
    is_lower_hex(&ev.id, 64)
        && is_lower_hex(&ev.pubkey, 64)
        && is_lower_hex(&ev.sig, 128)
        && ev.tags.iter().all(|t| !t.0.is_empty())
}

/// Check that the id matches the content and the signature matches the author.
pub fn verify_signature(ev: &Event) -> bool {
    verify_event(ev).is_ok()
}

fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
