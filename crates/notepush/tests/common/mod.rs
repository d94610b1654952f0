//! In-process relay and a fake remote signing agent for integration
//! tests. The relay speaks just enough of the protocol: it stores
//! EVENTs, answers REQ with stored matches plus EOSE, acks with OK and
//! broadcasts live events to open subscriptions.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tnostr::{
    Filter, FullKeypair, Note, NoteBuilder, PoolConfig, Pubkey, RelayPool, RelayStatus,
    UnsignedNote,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

struct LiveSub {
    sub_id: String,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Clone)]
pub struct TestRelay {
    pub url: String,
    store: Arc<Mutex<Vec<Note>>>,
    subs: Arc<Mutex<Vec<LiveSub>>>,
}

impl TestRelay {
    pub async fn start() -> TestRelay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = TestRelay {
            url: format!("ws://{}", addr),
            store: Arc::new(Mutex::new(Vec::new())),
            subs: Arc::new(Mutex::new(Vec::new())),
        };

        let accept_relay = relay.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let conn_relay = accept_relay.clone();
                tokio::spawn(async move { conn_relay.serve(stream).await });
            }
        });

        relay
    }

    async fn serve(self, stream: TcpStream) {
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(frame) => {
                        if write.send(Message::text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(txt))) => self.handle_frame(txt.as_str(), &tx),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                },
            }
        }
    }

    fn handle_frame(&self, frame: &str, tx: &mpsc::UnboundedSender<String>) {
        let Ok(value) = serde_json::from_str::<Value>(frame) else {
            return;
        };
        let Some(arr) = value.as_array() else { return };

        match arr.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let Ok(note) = serde_json::from_value::<Note>(arr[1].clone()) else {
                    return;
                };
                let ack = json!(["OK", note.id.hex(), true, ""]).to_string();
                for sub in self.subs.lock().unwrap().iter() {
                    if sub.filters.iter().any(|f| f.matches(&note)) {
                        let frame =
                            format!(r#"["EVENT","{}",{}]"#, sub.sub_id, note.to_json().unwrap());
                        let _ = sub.tx.send(frame);
                    }
                }
                self.store.lock().unwrap().push(note);
                let _ = tx.send(ack);
            }
            Some("REQ") => {
                let sub_id = arr[1].as_str().unwrap().to_owned();
                let filters: Vec<Filter> = arr[2..]
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect();

                for note in self.store.lock().unwrap().iter() {
                    if filters.iter().any(|f| f.matches(note)) {
                        let frame =
                            format!(r#"["EVENT","{}",{}]"#, sub_id, note.to_json().unwrap());
                        let _ = tx.send(frame);
                    }
                }
                let _ = tx.send(json!(["EOSE", sub_id]).to_string());

                self.subs.lock().unwrap().push(LiveSub {
                    sub_id,
                    filters,
                    tx: tx.clone(),
                });
            }
            Some("CLOSE") => {
                let sub_id = arr[1].as_str().unwrap_or_default();
                self.subs.lock().unwrap().retain(|s| s.sub_id != sub_id);
            }
            _ => {}
        }
    }
}

pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        max_wait: Duration::from_millis(800),
        coalesce_window: Duration::from_millis(1),
    }
}

pub async fn pool_for(relay: &TestRelay) -> RelayPool {
    let mut pool = RelayPool::new(fast_pool_config());
    pool.add_url(&relay.url);
    wait_connected(&pool).await;
    pool
}

pub async fn wait_connected(pool: &RelayPool) {
    for _ in 0..100 {
        if pool
            .statuses()
            .iter()
            .all(|(_, status)| *status == RelayStatus::Connected)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("relays never connected");
}

fn nip04_encrypt(secret: &tnostr::SecretKey, to: &Pubkey, plaintext: &str) -> String {
    let pk = nostr::PublicKey::from_slice(to.bytes()).unwrap();
    nostr::nips::nip04::encrypt(secret, &pk, plaintext).unwrap()
}

fn nip04_decrypt(secret: &tnostr::SecretKey, from: &Pubkey, ciphertext: &str) -> Option<String> {
    let pk = nostr::PublicKey::from_slice(from.bytes()).ok()?;
    nostr::nips::nip04::decrypt(secret, &pk, ciphertext).ok()
}

/// A remote signing agent living on the test relay: answers NIP-46
/// connect/get_public_key/sign_event/nip04_* requests with the user
/// keys it guards.
pub struct FakeBunker {
    pub user_keys: FullKeypair,
    pub uri: String,
    handle: JoinHandle<()>,
}

impl Drop for FakeBunker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl FakeBunker {
    pub async fn spawn(relay_url: &str, auth_url: Option<String>) -> FakeBunker {
        let user_keys = FullKeypair::generate();
        let uri = format!(
            "bunker://{}?{}",
            user_keys.pubkey.hex(),
            url::form_urlencoded::Serializer::new(String::new())
                .append_pair("relay", relay_url)
                .finish()
        );

        let mut pool = RelayPool::new(fast_pool_config());
        pool.add_url(relay_url);
        wait_connected(&pool).await;
        let mut sub = pool
            .subscribe(vec![Filter::new().kinds([24133]).pubkey(user_keys.pubkey)])
            .unwrap();

        let keys = user_keys.clone();
        let handle = tokio::spawn(async move {
            let mut challenged = false;
            while let Some(note) = sub.next_note().await {
                let Some(plain) =
                    nip04_decrypt(&keys.secret_key, &note.pubkey, &note.content)
                else {
                    continue;
                };
                let Ok(request) = serde_json::from_str::<Value>(&plain) else {
                    continue;
                };
                let id = request["id"].as_str().unwrap_or_default().to_owned();
                let method = request["method"].as_str().unwrap_or_default();
                let params = request["params"].as_array().cloned().unwrap_or_default();

                if method == "connect" {
                    if let (Some(url), false) = (&auth_url, challenged) {
                        challenged = true;
                        let challenge = json!({
                            "id": id,
                            "result": "auth_url",
                            "error": url,
                        });
                        respond(&pool, &keys, &note.pubkey, &challenge).await;
                        tokio::time::sleep(Duration::from_millis(150)).await;
                    }
                    let ack = json!({ "id": id, "result": "ack" });
                    respond(&pool, &keys, &note.pubkey, &ack).await;
                    continue;
                }

                let reply = match method {
                    "get_public_key" => json!({ "id": id, "result": keys.pubkey.hex() }),
                    "sign_event" => {
                        let unsigned = params
                            .first()
                            .and_then(Value::as_str)
                            .and_then(|raw| serde_json::from_str::<UnsignedNote>(raw).ok());
                        match unsigned.and_then(|u| u.sign(keys.to_filled()).ok()) {
                            Some(signed) => {
                                json!({ "id": id, "result": signed.to_json().unwrap() })
                            }
                            None => json!({ "id": id, "error": "cannot sign" }),
                        }
                    }
                    "nip04_encrypt" => {
                        let counterparty = params
                            .first()
                            .and_then(Value::as_str)
                            .and_then(|s| Pubkey::parse(s).ok());
                        let plaintext = params.get(1).and_then(Value::as_str);
                        match (counterparty, plaintext) {
                            (Some(pk), Some(text)) => json!({
                                "id": id,
                                "result": nip04_encrypt(&keys.secret_key, &pk, text),
                            }),
                            _ => json!({ "id": id, "error": "bad params" }),
                        }
                    }
                    "nip04_decrypt" => {
                        let counterparty = params
                            .first()
                            .and_then(Value::as_str)
                            .and_then(|s| Pubkey::parse(s).ok());
                        let ciphertext = params.get(1).and_then(Value::as_str);
                        match (counterparty, ciphertext)
                        {
                            (Some(pk), Some(cipher)) => {
                                match nip04_decrypt(&keys.secret_key, &pk, cipher) {
                                    Some(plain) => json!({ "id": id, "result": plain }),
                                    None => json!({ "id": id, "error": "decrypt failed" }),
                                }
                            }
                            _ => json!({ "id": id, "error": "bad params" }),
                        }
                    }
                    other => json!({ "id": id, "error": format!("unknown method {other}") }),
                };
                respond(&pool, &keys, &note.pubkey, &reply).await;
            }
        });

        FakeBunker {
            user_keys,
            uri,
            handle,
        }
    }
}

async fn respond(pool: &RelayPool, keys: &FullKeypair, to: &Pubkey, reply: &Value) {
    let ciphertext = nip04_encrypt(&keys.secret_key, to, &reply.to_string());
    let note = NoteBuilder::new()
        .kind(24133)
        .content(&ciphertext)
        .tag(vec!["p".to_owned(), to.hex()])
        .sign(keys.to_filled())
        .unwrap();
    pool.publish(&note).await.unwrap();
}
