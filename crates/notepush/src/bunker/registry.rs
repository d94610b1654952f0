use crate::bunker::{BridgeConfig, BunkerConnection, BunkerPointer};
use crate::storage::FileKeyStorage;
use crate::{Error, Result};

use std::collections::HashMap;
use std::sync::Arc;
use tnostr::Pubkey;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// In-memory registry of live remote-signer connections, keyed by the
/// canonical user pubkey and reconciled toward the durable hint store.
/// The store is the source of truth: entries on disk but not in memory
/// get reconnected, entries in memory but not on disk get persisted.
pub struct SignerRegistry {
    connections: Mutex<HashMap<Pubkey, Arc<BunkerConnection>>>,
    storage: FileKeyStorage,
    cfg: BridgeConfig,
}

impl SignerRegistry {
    pub fn new(storage: FileKeyStorage, cfg: BridgeConfig) -> Arc<Self> {
        Arc::new(SignerRegistry {
            connections: Mutex::new(HashMap::new()),
            storage,
            cfg,
        })
    }

    pub async fn get(&self, pubkey: &Pubkey) -> Option<Arc<BunkerConnection>> {
        self.connections.lock().await.get(pubkey).cloned()
    }

    /// Connect to a remote signer and record it, persisting the durable
    /// hint. An existing connection for the same identity is replaced,
    /// last writer wins.
    pub async fn connect(&self, uri: &str) -> Result<Arc<BunkerConnection>> {
        let pointer = BunkerPointer::parse(uri)?;
        let conn = BunkerConnection::connect(pointer, self.cfg.clone()).await?;
        let user = conn.user_pubkey();

        let mut connections = self.connections.lock().await;
        self.storage.add_bunker_hint(&user, uri)?;
        if let Some(old) = connections.insert(user, conn.clone()) {
            debug!("replacing remote signer connection for {}", user);
            old.disconnect();
        }
        Ok(conn)
    }

    /// Disconnect an identity. The durable hint goes first so a
    /// reconciliation tick that runs right after cannot resurrect the
    /// connection.
    pub async fn disconnect(&self, pubkey: &Pubkey) -> Result<()> {
        let mut connections = self.connections.lock().await;
        self.storage.remove_bunker_hint(pubkey)?;
        match connections.remove(pubkey) {
            Some(conn) => {
                conn.disconnect();
                info!("remote signer disconnected: {}", pubkey);
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    pub async fn connected_pubkeys(&self) -> Vec<Pubkey> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// One reconciliation pass. Idempotent; safe to run concurrently
    /// with user-initiated connects and disconnects.
    pub async fn reconcile(&self) {
        let hints = self.storage.get_bunker_hints();

        let to_connect: Vec<(Pubkey, String)> = {
            let connections = self.connections.lock().await;

            // memory-only entries get persisted back
            for (pubkey, conn) in connections.iter() {
                if !hints.iter().any(|(hint_pk, _)| hint_pk == pubkey) {
                    if let Err(e) = self
                        .storage
                        .add_bunker_hint(pubkey, &conn.pointer().to_uri())
                    {
                        warn!("failed to persist bunker hint for {}: {}", pubkey, e);
                    }
                }
            }

            hints
                .into_iter()
                .filter(|(pubkey, _)| !connections.contains_key(pubkey))
                .collect()
        };

        for (hinted, uri) in to_connect {
            debug!("reconnecting remote signer from hint: {}", hinted);
            let pointer = match BunkerPointer::parse(&uri) {
                Ok(pointer) => pointer,
                Err(e) => {
                    warn!("invalid bunker hint for {}: {}", hinted, e);
                    continue;
                }
            };
            match BunkerConnection::connect(pointer, self.cfg.clone()).await {
                Ok(conn) => {
                    let user = conn.user_pubkey();
                    let mut connections = self.connections.lock().await;

                    // re-check the hint under the lock; a disconnect may
                    // have raced this pass and must win
                    if self.storage.get_bunker_hint(&hinted).is_none() {
                        conn.disconnect();
                        continue;
                    }
                    if connections.contains_key(&user) {
                        // a user-initiated connect got here first
                        conn.disconnect();
                        continue;
                    }
                    if user != hinted {
                        warn!(
                            "bunker hint {} resolved to different user {}, rekeying",
                            hinted, user
                        );
                        let _ = self.storage.remove_bunker_hint(&hinted);
                        if let Err(e) = self.storage.add_bunker_hint(&user, &uri) {
                            warn!("failed to persist bunker hint for {}: {}", user, e);
                        }
                    }
                    connections.insert(user, conn);
                }
                Err(e) => {
                    warn!("reconnect failed for {}: {}", hinted, e);
                }
            }
        }
    }

    /// Eager startup restore plus the recurring reconciliation loop.
    pub fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.reconcile().await;
            let mut ticker = tokio::time::interval(registry.cfg.reconcile_interval);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                registry.reconcile().await;
            }
        })
    }
}
