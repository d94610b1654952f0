use crate::signer::{nip04_decrypt_with, Signer};
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tnostr::{Filter, Note, NoteBuilder, Pubkey, RelayAck, RelayPool, SecretKey};
use tracing::{debug, warn};

/// Mailbox messages travel as NIP-04 encrypted direct messages.
pub const MAILBOX_KIND: u32 = 4;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum MailboxMessageType {
    #[serde(rename = "SUBSCRIBE")]
    Subscribe,
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MailboxMessage {
    #[serde(rename = "type")]
    pub message_type: MailboxMessageType,
    pub payload: Value,
    pub timestamp: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MailboxMessage {
    pub fn subscribe(payload: Value) -> Self {
        MailboxMessage {
            message_type: MailboxMessageType::Subscribe,
            payload,
            timestamp: unix_now(),
        }
    }

    pub fn unsubscribe(payload: Value) -> Self {
        MailboxMessage {
            message_type: MailboxMessageType::Unsubscribe,
            payload,
            timestamp: unix_now(),
        }
    }
}

/// Fold messages in delivery order into the visible state map, keyed by
/// the named payload field. SUBSCRIBE inserts or overwrites,
/// UNSUBSCRIBE removes. Replaying the same ordered list is idempotent.
pub fn fold_messages(
    messages: impl IntoIterator<Item = MailboxMessage>,
    key_field: &str,
) -> HashMap<String, MailboxMessage> {
    let mut state = HashMap::new();
    for message in messages {
        let Some(key) = message.payload.get(key_field).and_then(Value::as_str) else {
            warn!("mailbox message has no '{}' field, skipping", key_field);
            continue;
        };
        match message.message_type {
            MailboxMessageType::Subscribe => {
                state.insert(key.to_owned(), message);
            }
            MailboxMessageType::Unsubscribe => {
                state.remove(key);
            }
        }
    }
    state
}

/// A serverless key-value log: encrypted control messages addressed to a
/// fixed recipient, replayed from the relay network to reconstruct
/// state.
pub struct Mailbox<'a> {
    pool: &'a RelayPool,
    recipient: Pubkey,
}

impl<'a> Mailbox<'a> {
    pub fn new(pool: &'a RelayPool, recipient: Pubkey) -> Self {
        Mailbox { pool, recipient }
    }

    pub fn recipient(&self) -> Pubkey {
        self.recipient
    }

    /// Encrypt and publish one control message. Failing to encrypt our
    /// own message is a hard error; relay rejections stay per-relay
    /// until every relay refused.
    pub async fn send(&self, signer: &dyn Signer, message: &MailboxMessage) -> Result<Vec<RelayAck>> {
        let plaintext = serde_json::to_string(message)?;
        let ciphertext = signer.nip04_encrypt(&self.recipient, &plaintext).await?;

        let unsigned = NoteBuilder::new()
            .kind(MAILBOX_KIND)
            .content(&ciphertext)
            .tag(vec!["p".to_owned(), self.recipient.hex()])
            .unsigned(signer.pubkey());
        let note = signer.sign(unsigned).await?;

        let acks = self.pool.publish(&note).await.map_err(Error::Wire)?;
        if acks.iter().all(|ack| !ack.accepted) {
            return Err(Error::PublishFailed);
        }
        Ok(acks)
    }

    /// Replay the mailbox history and fold it into the current state.
    /// Messages that fail to decrypt or parse are skipped, never fatal;
    /// one malformed message cannot poison the reconstruction.
    pub async fn reconstruct(
        &self,
        recipient_secret: &SecretKey,
        key_field: &str,
    ) -> HashMap<String, MailboxMessage> {
        let notes = self
            .pool
            .fetch_all(vec![Filter::new()
                .kinds([MAILBOX_KIND])
                .pubkey(self.recipient)])
            .await;
        debug!("mailbox replay: {} events", notes.len());

        let messages = notes
            .into_iter()
            .filter_map(|note| match self.open_message(recipient_secret, &note) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("skipping undecodable mailbox event {}: {}", note.id.hex(), e);
                    None
                }
            });
        fold_messages(messages, key_field)
    }

    /// Push-transport hook: a failed delivery turns into an UNSUBSCRIBE
    /// publish for that endpoint.
    pub async fn delivery_failed(
        &self,
        signer: &dyn Signer,
        key_field: &str,
        endpoint: &str,
    ) -> Result<Vec<RelayAck>> {
        let message = MailboxMessage::unsubscribe(serde_json::json!({ key_field: endpoint }));
        self.send(signer, &message).await
    }

    fn open_message(&self, recipient_secret: &SecretKey, note: &Note) -> Result<MailboxMessage> {
        let plaintext = nip04_decrypt_with(recipient_secret, &note.pubkey, &note.content)?;
        serde_json::from_str(&plaintext).map_err(Into::into)
    }
}
