use crate::{Error, FilledKeypair, Pubkey};

use secp256k1::schnorr::Signature;
use secp256k1::{Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NoteId([u8; 32]);

static HRP_NOTE: bech32::Hrp = bech32::Hrp::parse_unchecked("note");

impl fmt::Debug for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl NoteId {
    pub fn new(bytes: [u8; 32]) -> Self {
        NoteId(bytes)
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        Ok(NoteId(hex::decode(hex_str)?.as_slice().try_into()?))
    }

    pub fn to_bech(&self) -> Option<String> {
        bech32::encode::<bech32::Bech32>(HRP_NOTE, &self.0).ok()
    }
}

impl Serialize for NoteId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for NoteId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NoteId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The id preimage: the canonical JSON array over everything that is
/// signed. Tag order matters; reordering tags changes the id.
fn compute_id(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32], Error> {
    let preimage = json!([0, pubkey.hex(), created_at, kind, tags, content]);
    let raw = serde_json::to_string(&preimage)?;
    let digest = Sha256::digest(raw.as_bytes());
    Ok(digest.into())
}

/// A draft event: everything but the id and signature. Never hits the
/// network in this form.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct UnsignedNote {
    pub pubkey: Pubkey,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedNote {
    pub fn id(&self) -> Result<NoteId, Error> {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
        .map(NoteId::new)
    }

    pub fn sign(self, keys: FilledKeypair<'_>) -> Result<Note, Error> {
        if self.pubkey != *keys.pubkey {
            return Err(Error::InvalidPublicKey);
        }
        let id = self.id()?;

        let secp = Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&keys.secret_key.to_secret_bytes())
            .map_err(|_| Error::InvalidSecretKey)?;
        let keypair = secp256k1::Keypair::from_secret_key(&secp, &sk);
        let sig = secp.sign_schnorr(id.bytes().as_slice(), &keypair);

        Ok(Note {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.as_ref()),
        })
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

/// A signed, immutable nostr event.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Note {
    /// 32-byte sha256 of the serialized event data
    pub id: NoteId,
    /// 32-byte public key of the event creator
    pub pubkey: Pubkey,
    /// unix timestamp in seconds
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// 64-byte schnorr signature over the id
    pub sig: String,
}

impl Hash for Note {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.0.hash(state);
    }
}

impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Note {}

impl Note {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(Into::into)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Recomputes the id and checks the signature against the author
    /// pubkey. Any mismatch is a hard `InvalidSignature`.
    pub fn verify(&self) -> Result<(), Error> {
        let expected =
            compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if expected != *self.id.bytes() {
            return Err(Error::InvalidSignature);
        }

        let sig_bytes = hex::decode(&self.sig)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| Error::InvalidSignature)?;
        let pk =
            XOnlyPublicKey::from_slice(self.pubkey.bytes()).map_err(|_| Error::InvalidPublicKey)?;
        let secp = Secp256k1::new();
        secp.verify_schnorr(&sig, self.id.bytes().as_slice(), &pk)
            .map_err(|_| Error::InvalidSignature)
    }

    /// First value of each tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }
}

/// Chained builder for drafts. `start_tag` opens a new tag, `tag_str`
/// appends an element to the open tag.
#[derive(Debug, Default, Clone)]
pub struct NoteBuilder {
    kind: u32,
    content: String,
    tags: Vec<Vec<String>>,
    created_at: Option<u64>,
}

impl NoteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kind = kind;
        self
    }

    pub fn content(mut self, content: &str) -> Self {
        self.content = content.to_owned();
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn start_tag(mut self) -> Self {
        self.tags.push(Vec::new());
        self
    }

    pub fn tag_str(mut self, s: &str) -> Self {
        match self.tags.last_mut() {
            Some(tag) => tag.push(s.to_owned()),
            None => self.tags.push(vec![s.to_owned()]),
        }
        self
    }

    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn unsigned(self, pubkey: Pubkey) -> UnsignedNote {
        UnsignedNote {
            pubkey,
            created_at: self.created_at.unwrap_or_else(unix_now),
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }

    pub fn sign(self, keys: FilledKeypair<'_>) -> Result<Note, Error> {
        self.unsigned(*keys.pubkey).sign(keys)
    }
}
