use crate::bunker::registry::SignerRegistry;
use crate::bunker::BunkerPointer;
use crate::signer::{LocalSigner, Signer};
use crate::storage::FileKeyStorage;
use crate::{Error, Result};

use std::collections::BTreeMap;
use std::sync::Arc;
use tnostr::{FullKeypair, Keypair, Pubkey};
use tracing::info;

/// An identity is either a locally held key or a pointer to a remote
/// signing delegate.
#[derive(Debug, Clone)]
pub enum AccountKey {
    Local(Keypair),
    Remote { pubkey: Pubkey, bunker: BunkerPointer },
}

impl AccountKey {
    pub fn pubkey(&self) -> Pubkey {
        match self {
            AccountKey::Local(kp) => kp.pubkey,
            AccountKey::Remote { pubkey, .. } => *pubkey,
        }
    }
}

/// The interface for managing the user's identities. Loads from and
/// persists to file key storage; generates an identity on first use.
pub struct Accounts {
    storage: FileKeyStorage,
    accounts: BTreeMap<Pubkey, AccountKey>,
    selected: Option<Pubkey>,
}

impl Accounts {
    pub fn new(storage: FileKeyStorage) -> Result<Self> {
        let mut accounts = BTreeMap::new();
        for key in storage.get_keys()? {
            accounts.insert(key.pubkey, AccountKey::Local(key));
        }
        for (pubkey, uri) in storage.get_bunker_hints() {
            match BunkerPointer::parse(&uri) {
                Ok(bunker) => {
                    accounts.insert(pubkey, AccountKey::Remote { pubkey, bunker });
                }
                Err(e) => info!("skipping unreadable bunker hint for {}: {}", pubkey, e),
            }
        }

        let mut selected = storage
            .get_selected_key()?
            .filter(|pk| accounts.contains_key(pk));

        if accounts.is_empty() {
            let generated = FullKeypair::generate();
            info!("no stored identity, generated {}", generated.pubkey);
            let kp = generated.to_keypair();
            storage.add_key(&kp)?;
            storage.select_key(Some(kp.pubkey))?;
            selected = Some(kp.pubkey);
            accounts.insert(kp.pubkey, AccountKey::Local(kp));
        } else if selected.is_none() {
            selected = accounts.keys().next().copied();
            storage.select_key(selected)?;
        }

        Ok(Accounts {
            storage,
            accounts,
            selected,
        })
    }

    pub fn num_accounts(&self) -> usize {
        self.accounts.len()
    }

    pub fn pubkeys(&self) -> Vec<Pubkey> {
        self.accounts.keys().copied().collect()
    }

    pub fn get(&self, pubkey: &Pubkey) -> Option<&AccountKey> {
        self.accounts.get(pubkey)
    }

    pub fn selected_pubkey(&self) -> Option<Pubkey> {
        self.selected
    }

    pub fn selected(&self) -> Option<&AccountKey> {
        self.selected.as_ref().and_then(|pk| self.accounts.get(pk))
    }

    /// Resolve the active identity to a signing capability. Remote
    /// identities resolve through the live connection registry.
    pub async fn signer(&self, registry: &SignerRegistry) -> Result<Arc<dyn Signer>> {
        let selected = self.selected.ok_or(Error::NoActiveIdentity)?;
        match self.accounts.get(&selected).ok_or(Error::NoActiveIdentity)? {
            AccountKey::Local(kp) => {
                let filled = kp.to_full().ok_or(Error::UnsupportedIdentity)?;
                Ok(Arc::new(LocalSigner::new(filled.to_full())))
            }
            AccountKey::Remote { pubkey, .. } => {
                let conn = registry.get(pubkey).await.ok_or(Error::NotConnected)?;
                Ok(conn)
            }
        }
    }

    pub fn add_local(&mut self, keys: FullKeypair) -> Result<Pubkey> {
        let kp = keys.to_keypair();
        let pubkey = kp.pubkey;
        self.storage.add_key(&kp)?;
        self.accounts.insert(pubkey, AccountKey::Local(kp));
        Ok(pubkey)
    }

    /// Connect a remote delegate and adopt it as an account. The durable
    /// hint is persisted by the registry on successful connect.
    pub async fn add_bunker(&mut self, uri: &str, registry: &SignerRegistry) -> Result<Pubkey> {
        let conn = registry.connect(uri).await?;
        let pubkey = conn.user_pubkey();
        self.accounts.insert(
            pubkey,
            AccountKey::Remote {
                pubkey,
                bunker: conn.pointer().clone(),
            },
        );
        Ok(pubkey)
    }

    /// Switch the active identity. Atomic from the caller's view: a
    /// remote identity must be connected before the selection commits;
    /// on failure the previous selection stays.
    pub async fn switch_to(&mut self, pubkey: Pubkey, registry: &SignerRegistry) -> Result<()> {
        let account = self.accounts.get(&pubkey).ok_or(Error::UnknownAccount)?;
        if let AccountKey::Remote { bunker, .. } = account {
            if registry.get(&pubkey).await.is_none() {
                let conn = registry.connect(&bunker.to_uri()).await?;
                if conn.user_pubkey() != pubkey {
                    let got = conn.user_pubkey();
                    let _ = registry.disconnect(&got).await;
                    return Err(Error::Generic(format!(
                        "bunker resolved to unexpected identity {got}"
                    )));
                }
            }
        }
        self.storage.select_key(Some(pubkey))?;
        self.selected = Some(pubkey);
        Ok(())
    }

    pub async fn remove(&mut self, pubkey: &Pubkey, registry: &SignerRegistry) -> Result<()> {
        match self.accounts.remove(pubkey) {
            None => return Err(Error::UnknownAccount),
            Some(AccountKey::Local(_)) => {
                self.storage.remove_key(pubkey)?;
            }
            Some(AccountKey::Remote { .. }) => {
                // also removes the durable hint; NotConnected just means
                // there was no live connection to tear down
                match registry.disconnect(pubkey).await {
                    Ok(()) | Err(Error::NotConnected) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if self.selected == Some(*pubkey) {
            self.selected = self.accounts.keys().next().copied();
            self.storage.select_key(self.selected)?;
        }
        Ok(())
    }

    /// Export the secret key of a local identity. Remote identities hold
    /// no local secret.
    pub fn export_nsec(&self, pubkey: &Pubkey) -> Result<String> {
        match self.accounts.get(pubkey).ok_or(Error::UnknownAccount)? {
            AccountKey::Local(kp) => kp
                .to_full()
                .map(|filled| filled.to_full())
                .and_then(|full| full.to_nsec())
                .ok_or(Error::UnsupportedIdentity),
            AccountKey::Remote { .. } => Err(Error::UnsupportedIdentity),
        }
    }
}
