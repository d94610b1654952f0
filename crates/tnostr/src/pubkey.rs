use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;
use std::fmt;
use std::ops::Deref;

/// A 32-byte x-only public key. This is the canonical identity
/// representation: hex and npub inputs both collapse into it, so it is
/// safe to use as a map key everywhere.
#[derive(Eq, PartialEq, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct Pubkey([u8; 32]);

static HRP_NPUB: bech32::Hrp = bech32::Hrp::parse_unchecked("npub");

impl Deref for Pubkey {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Pubkey {
    pub fn new(data: [u8; 32]) -> Self {
        Self(data)
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }

    /// Accepts either hex or npub input and normalizes to raw bytes.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match Pubkey::from_hex(s) {
            Ok(pk) => Ok(pk),
            Err(_) => Pubkey::from_npub(s),
        }
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        Ok(Pubkey(hex::decode(hex_str)?.as_slice().try_into()?))
    }

    pub fn from_npub(s: &str) -> Result<Self, Error> {
        let (hrp, data) = bech32::decode(s).map_err(|_| Error::InvalidBech32)?;
        if hrp != HRP_NPUB {
            return Err(Error::InvalidBech32);
        }
        let bytes: [u8; 32] = data.as_slice().try_into()?;
        Ok(Pubkey(bytes))
    }

    pub fn to_npub(&self) -> Option<String> {
        bech32::encode::<bech32::Bech32>(HRP_NPUB, &self.0).ok()
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl std::str::FromStr for Pubkey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Pubkey::parse(s)
    }
}

impl From<Pubkey> for String {
    fn from(pk: Pubkey) -> Self {
        pk.hex()
    }
}

impl Serialize for Pubkey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Pubkey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
