//! Nostr event model and canonical id computation.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The ones this crate relies on:
///
/// - `d` – caller-assigned identifier of an order
/// - `e` – reference to another event ID (confirmations point at the order)
///
/// Each tag is stored verbatim and in order, since the order is part of the
/// hashed payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from its name followed by its values.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }

    /// `["d", id]`
    pub fn identifier(id: impl Into<String>) -> Self {
        Tag(vec!["d".into(), id.into()])
    }

    /// `["e", event_id]`
    pub fn event(event_id: impl Into<String>) -> Self {
        Tag(vec!["e".into(), event_id.into()])
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the tag name, the one filters match against.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as exchanged with relays.
///
/// ```json
/// {
///   "id": "4376c65d2f232afbe9b882a35baa4f6fe8667c4e684749af565f981833ed6a65",
///   "pubkey": "6e468422dfb74a5738702a8823b9b28168abab8655faacb6853cd0ee15deee93",
///   "kind": 38383,
///   "created_at": 1700000000,
///   "tags": [["d", "0b1c5a7e-..."]],
///   "content": "[{\"order\":{...}}]",
///   "sig": "908a15e46fb4d8675bab026fc230a0e3542bfade63da02d542fb78b2a8513fcd..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `38383`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// BIP-340 Schnorr signature over the event id.
    pub sig: String,
}

impl Event {
    /// Recompute the id from the other fields.
    pub fn compute_id(&self) -> String {
        compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Fail when the stored id does not match the canonical hash.
    pub fn verify_id(&self) -> Result<()> {
        let calc = self.compute_id();
        if calc != self.id {
            return Err(Error::crypto(format!(
                "id mismatch: carried {}, computed {calc}",
                self.id
            )));
        }
        Ok(())
    }

    /// Values of every tag named `name`, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// The `d` tag value, if any.
    pub fn identifier(&self) -> Option<&str> {
        self.tag_values("d").next()
    }
}

/// Event with a computed id, waiting for a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// The exact bytes hashed into `id`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Raw 32-byte digest behind `id`.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.canonical_bytes()).into()
    }

    /// Attach a signature, producing the final immutable event.
    pub fn into_signed(self, sig: String) -> Event {
        Event {
            id: self.id,
            pubkey: self.pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// Assembles the signable form of an event.
///
/// No I/O happens here. The pubkey is supplied at [`EventBuilder::build`] because
/// it is part of the hashed tuple.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    kind: u32,
    tags: Vec<Tag>,
    content: String,
    created_at: Option<u64>,
}

impl EventBuilder {
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
            created_at: None,
        }
    }

    /// Append a single tag after the existing ones.
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Pin the timestamp. Defaults to the current time.
    pub fn created_at(mut self, ts: u64) -> Self {
        self.created_at = Some(ts);
        self
    }

    pub fn build(self, pubkey: impl Into<String>) -> UnsignedEvent {
        let pubkey = pubkey.into();
        let created_at = self.created_at.unwrap_or_else(unix_now);
        let id = compute_id(&pubkey, created_at, self.kind, &self.tags, &self.content);
        UnsignedEvent {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

/// Serialize `[0, pubkey, created_at, kind, tags, content]` compactly.
pub fn canonical_bytes(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Vec<u8> {
    // Tuples serialize as JSON arrays and serde_json emits no whitespace, so the
    // output is the NIP-01 form. Serializing strings and integers cannot fail.
    serde_json::to_vec(&(0u8, pubkey, created_at, kind, tags, content)).unwrap_or_default()
}

/// Hex SHA-256 of the canonical serialization.
pub fn compute_id(pubkey: &str, created_at: u64, kind: u32, tags: &[Tag], content: &str) -> String {
    hex::encode(Sha256::digest(canonical_bytes(pubkey, created_at, kind, tags, content)))
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
