use crate::signer::{nip04_decrypt_with, nip04_encrypt_with, Signer};
use crate::{Error, Result};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tnostr::{
    Filter, FullKeypair, Note, NoteBuilder, PoolConfig, Pubkey, RelayPool, Subscription,
    UnsignedNote,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod registry;

/// NIP-46 remote signing event kind.
pub const NIP46_KIND: u32 = 24133;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub pool: PoolConfig,
    /// Wait for the initial connect ack.
    pub connect_timeout: Duration,
    /// Wait for out-of-band approval once an auth challenge arrived.
    pub auth_timeout: Duration,
    /// Wait for any other RPC response.
    pub request_timeout: Duration,
    /// Interval of the registry reconciliation loop.
    pub reconcile_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            pool: PoolConfig::default(),
            connect_timeout: Duration::from_secs(20),
            auth_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

/// Parsed `bunker://<signer-pubkey>?relay=..&secret=..` pointer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BunkerPointer {
    pub signer_pubkey: Pubkey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

impl BunkerPointer {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = url::Url::parse(uri).map_err(|e| Error::Generic(e.to_string()))?;
        if url.scheme() != "bunker" {
            return Err(Error::Generic(format!(
                "not a bunker uri: {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Generic("bunker uri has no signer pubkey".to_owned()))?;
        let signer_pubkey = Pubkey::parse(host).map_err(Error::Wire)?;

        let mut relays = Vec::new();
        let mut secret = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "relay" => relays.push(value.into_owned()),
                "secret" => secret = Some(value.into_owned()),
                _ => {}
            }
        }
        if relays.is_empty() {
            return Err(Error::Generic("bunker uri has no relay hints".to_owned()));
        }

        Ok(BunkerPointer {
            signer_pubkey,
            relays,
            secret,
        })
    }

    pub fn to_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay);
        }
        if let Some(secret) = &self.secret {
            query.append_pair("secret", secret);
        }
        format!("bunker://{}?{}", self.signer_pubkey.hex(), query.finish())
    }
}

/// Connection lifecycle. `AwaitingAuth` holds the approval URL the caller
/// has to surface.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    AwaitingAuth(String),
    Connected,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: &'a str,
    method: &'a str,
    params: &'a [String],
}

#[derive(Deserialize, Debug, Clone)]
struct RpcReply {
    id: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl RpcReply {
    fn auth_url(&self) -> Option<&str> {
        if self.result.as_deref() == Some("auth_url") {
            self.error.as_deref()
        } else {
            None
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RpcReply>>>>;

fn pending_insert(pending: &PendingMap, id: String, tx: mpsc::UnboundedSender<RpcReply>) {
    pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, tx);
}

fn pending_remove(pending: &PendingMap, id: &str) {
    pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(id);
}

/// A live connection to a remote signing agent. The ephemeral client
/// keypair only authenticates this connection; it never signs user
/// events.
pub struct BunkerConnection {
    client_keys: FullKeypair,
    pointer: BunkerPointer,
    user_pubkey: Pubkey,
    state: watch::Sender<BridgeState>,
    pool: RelayPool,
    pending: PendingMap,
    listener: JoinHandle<()>,
    cfg: BridgeConfig,
}

impl BunkerConnection {
    pub async fn connect(pointer: BunkerPointer, cfg: BridgeConfig) -> Result<Arc<Self>> {
        let client_keys = FullKeypair::generate();
        let mut pool = RelayPool::new(cfg.pool.clone());
        pool.add_urls(pointer.relays.iter().cloned());

        let (state, _) = watch::channel(BridgeState::Connecting);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let sub = pool.subscribe(vec![Filter::new()
            .kinds([NIP46_KIND])
            .pubkey(client_keys.pubkey)])?;
        let listener = tokio::spawn(listen(
            sub,
            client_keys.clone(),
            pending.clone(),
            state.clone(),
        ));

        let mut params = vec![pointer.signer_pubkey.hex()];
        if let Some(secret) = &pointer.secret {
            params.push(secret.clone());
        }

        let user_pubkey = match handshake(
            &pool,
            &pending,
            &client_keys,
            &pointer,
            &cfg,
            params,
            &state,
        )
        .await
        {
            Ok(pk) => pk,
            Err(e) => {
                listener.abort();
                state.send_replace(BridgeState::Disconnected);
                return Err(e);
            }
        };

        state.send_replace(BridgeState::Connected);
        info!(
            "remote signer connected: user {} via {}",
            user_pubkey, pointer.signer_pubkey
        );

        Ok(Arc::new(BunkerConnection {
            client_keys,
            pointer,
            user_pubkey,
            state,
            pool,
            pending,
            listener,
            cfg,
        }))
    }

    pub fn user_pubkey(&self) -> Pubkey {
        self.user_pubkey
    }

    pub fn pointer(&self) -> &BunkerPointer {
        &self.pointer
    }

    pub fn state(&self) -> BridgeState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn disconnect(&self) {
        self.listener.abort();
        self.state.send_replace(BridgeState::Disconnected);
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            BridgeState::Connected => Ok(()),
            BridgeState::AwaitingAuth(url) => Err(Error::AuthRequired(url)),
            BridgeState::Connecting | BridgeState::Disconnected => Err(Error::NotConnected),
        }
    }

    async fn rpc(&self, method: &str, params: Vec<String>) -> Result<RpcReply> {
        self.ensure_usable()?;

        let (id, mut rx) = request_raw(
            &self.pool,
            &self.pending,
            &self.client_keys,
            &self.pointer,
            method,
            params,
        )
        .await?;

        let outcome = tokio::time::timeout(self.cfg.request_timeout, rx.recv()).await;
        pending_remove(&self.pending, &id);

        let reply = match outcome {
            Err(_) => return Err(Error::Bunker(format!("{method} timed out"))),
            Ok(None) => return Err(Error::NotConnected),
            Ok(Some(reply)) => reply,
        };

        if let Some(url) = reply.auth_url() {
            return Err(Error::AuthRequired(url.to_owned()));
        }
        if let Some(err) = reply.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(Error::Bunker(err.to_owned()));
        }
        Ok(reply)
    }

    /// Delegate signing to the remote agent. The returned event is
    /// verified before acceptance; a bad signature is a hard failure.
    pub async fn sign_note(&self, unsigned: UnsignedNote) -> Result<Note> {
        let reply = self.rpc("sign_event", vec![unsigned.to_json()?]).await?;
        let json = reply
            .result
            .ok_or_else(|| Error::Bunker("empty sign_event result".to_owned()))?;
        let note = Note::from_json(&json).map_err(Error::Wire)?;
        note.verify().map_err(Error::Wire)?;
        if note.pubkey != self.user_pubkey {
            return Err(Error::Wire(tnostr::Error::InvalidSignature));
        }
        Ok(note)
    }
}

impl Drop for BunkerConnection {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Signer for BunkerConnection {
    fn pubkey(&self) -> Pubkey {
        self.user_pubkey
    }

    async fn sign(&self, unsigned: UnsignedNote) -> Result<Note> {
        self.sign_note(unsigned).await
    }

    async fn nip04_encrypt(&self, counterparty: &Pubkey, plaintext: &str) -> Result<String> {
        let reply = self
            .rpc(
                "nip04_encrypt",
                vec![counterparty.hex(), plaintext.to_owned()],
            )
            .await?;
        reply
            .result
            .ok_or_else(|| Error::Bunker("empty nip04_encrypt result".to_owned()))
    }

    async fn nip04_decrypt(&self, counterparty: &Pubkey, ciphertext: &str) -> Result<String> {
        let reply = self
            .rpc(
                "nip04_decrypt",
                vec![counterparty.hex(), ciphertext.to_owned()],
            )
            .await?;
        reply
            .result
            .ok_or_else(|| Error::Bunker("empty nip04_decrypt result".to_owned()))
    }
}

/// Encrypt, wrap and publish one request; responses for its id flow into
/// the returned channel until the entry is removed.
async fn request_raw(
    pool: &RelayPool,
    pending: &PendingMap,
    client_keys: &FullKeypair,
    pointer: &BunkerPointer,
    method: &str,
    params: Vec<String>,
) -> Result<(String, mpsc::UnboundedReceiver<RpcReply>)> {
    let id = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&RpcRequest {
        id: &id,
        method,
        params: &params,
    })?;
    let ciphertext = nip04_encrypt_with(
        &client_keys.secret_key,
        &pointer.signer_pubkey,
        &payload,
    )?;
    let note = NoteBuilder::new()
        .kind(NIP46_KIND)
        .content(&ciphertext)
        .tag(vec!["p".to_owned(), pointer.signer_pubkey.hex()])
        .unsigned(client_keys.pubkey)
        .sign(client_keys.to_filled())
        .map_err(Error::Wire)?;

    let (tx, rx) = mpsc::unbounded_channel();
    pending_insert(pending, id.clone(), tx);

    let acks = pool.publish(&note).await.map_err(Error::Wire)?;
    if acks.iter().all(|a| !a.accepted) {
        pending_remove(pending, &id);
        return Err(Error::PublishFailed);
    }

    debug!("sent {} request {} to {}", method, id, pointer.signer_pubkey);
    Ok((id, rx))
}

async fn handshake(
    pool: &RelayPool,
    pending: &PendingMap,
    client_keys: &FullKeypair,
    pointer: &BunkerPointer,
    cfg: &BridgeConfig,
    params: Vec<String>,
    state: &watch::Sender<BridgeState>,
) -> Result<Pubkey> {
    let (id, mut rx) = request_raw(pool, pending, client_keys, pointer, "connect", params).await?;

    let mut deadline = cfg.connect_timeout;
    loop {
        match tokio::time::timeout(deadline, rx.recv()).await {
            Err(_) => {
                pending_remove(pending, &id);
                return Err(match state.borrow().clone() {
                    BridgeState::AwaitingAuth(url) => Error::AuthRequired(url),
                    _ => Error::NotConnected,
                });
            }
            Ok(None) => {
                pending_remove(pending, &id);
                return Err(Error::NotConnected);
            }
            Ok(Some(reply)) => {
                if let Some(url) = reply.auth_url() {
                    info!("remote signer requires approval: {url}");
                    // hold until approval lands or the larger window runs out
                    deadline = cfg.auth_timeout;
                    continue;
                }
                if let Some(err) = reply.error.as_deref().filter(|e| !e.is_empty()) {
                    pending_remove(pending, &id);
                    return Err(Error::Bunker(err.to_owned()));
                }
                break;
            }
        }
    }
    pending_remove(pending, &id);

    // the user identity is not necessarily the bunker key itself
    let (id, mut rx) =
        request_raw(pool, pending, client_keys, pointer, "get_public_key", vec![]).await?;
    let outcome = tokio::time::timeout(cfg.request_timeout, rx.recv()).await;
    pending_remove(pending, &id);

    match outcome {
        Err(_) => Err(Error::Bunker("get_public_key timed out".to_owned())),
        Ok(None) => Err(Error::NotConnected),
        Ok(Some(reply)) => {
            if let Some(err) = reply.error.as_deref().filter(|e| !e.is_empty()) {
                return Err(Error::Bunker(err.to_owned()));
            }
            let hexpk = reply
                .result
                .ok_or_else(|| Error::Bunker("empty get_public_key result".to_owned()))?;
            Pubkey::parse(&hexpk).map_err(Error::Wire)
        }
    }
}

async fn listen(
    mut sub: Subscription,
    client_keys: FullKeypair,
    pending: PendingMap,
    state: watch::Sender<BridgeState>,
) {
    while let Some(note) = sub.next_note().await {
        if note.kind != NIP46_KIND {
            continue;
        }
        let plain = match nip04_decrypt_with(&client_keys.secret_key, &note.pubkey, &note.content)
        {
            Ok(plain) => plain,
            Err(e) => {
                warn!("undecryptable signer response from {}: {}", note.pubkey, e);
                continue;
            }
        };
        let reply: RpcReply = match serde_json::from_str(&plain) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("unparseable signer response: {e}");
                continue;
            }
        };

        if let Some(url) = reply.auth_url() {
            state.send_replace(BridgeState::AwaitingAuth(url.to_owned()));
        } else if matches!(state.borrow().clone(), BridgeState::AwaitingAuth(_)) {
            // approval completed, the agent is answering again
            state.send_replace(BridgeState::Connected);
        }

        let tx = pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&reply.id)
            .cloned();
        match tx {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("unroutable signer reply: {}", reply.id),
        }
    }
}
