use crate::{Error, Result};
use async_trait::async_trait;
use tnostr::{FullKeypair, Note, Pubkey, SecretKey, UnsignedNote};

/// A signing capability. Local keys and remote delegates expose the same
/// contract, so callers never branch on where the secret lives.
#[async_trait]
pub trait Signer: Send + Sync {
    fn pubkey(&self) -> Pubkey;

    async fn sign(&self, unsigned: UnsignedNote) -> Result<Note>;

    async fn nip04_encrypt(&self, counterparty: &Pubkey, plaintext: &str) -> Result<String>;

    async fn nip04_decrypt(&self, counterparty: &Pubkey, ciphertext: &str) -> Result<String>;
}

pub(crate) fn nip04_encrypt_with(
    secret: &SecretKey,
    counterparty: &Pubkey,
    plaintext: &str,
) -> Result<String> {
    let pk = nostr::PublicKey::from_slice(counterparty.bytes())
        .map_err(|_| Error::Wire(tnostr::Error::InvalidPublicKey))?;
    nostr::nips::nip04::encrypt(secret, &pk, plaintext).map_err(|e| Error::Crypto(e.to_string()))
}

pub(crate) fn nip04_decrypt_with(
    secret: &SecretKey,
    counterparty: &Pubkey,
    ciphertext: &str,
) -> Result<String> {
    let pk = nostr::PublicKey::from_slice(counterparty.bytes())
        .map_err(|_| Error::Wire(tnostr::Error::InvalidPublicKey))?;
    nostr::nips::nip04::decrypt(secret, &pk, ciphertext).map_err(|e| Error::Decrypt(e.to_string()))
}

/// Signs with a locally held secret key.
pub struct LocalSigner {
    keys: FullKeypair,
}

impl LocalSigner {
    pub fn new(keys: FullKeypair) -> Self {
        LocalSigner { keys }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn pubkey(&self) -> Pubkey {
        self.keys.pubkey
    }

    async fn sign(&self, unsigned: UnsignedNote) -> Result<Note> {
        unsigned.sign(self.keys.to_filled()).map_err(Into::into)
    }

    async fn nip04_encrypt(&self, counterparty: &Pubkey, plaintext: &str) -> Result<String> {
        nip04_encrypt_with(&self.keys.secret_key, counterparty, plaintext)
    }

    async fn nip04_decrypt(&self, counterparty: &Pubkey, ciphertext: &str) -> Result<String> {
        nip04_decrypt_with(&self.keys.secret_key, counterparty, ciphertext)
    }
}
