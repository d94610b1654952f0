//! Minimal in-process relay for exercising the client transport.
//!
//! Speaks just enough of the relay protocol: stores EVENTs, answers REQ
//! with stored matches followed by EOSE, acks EVENT with OK, broadcasts
//! live events to open subscriptions, honors CLOSE.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tnostr::{Filter, Note, RelayPool, RelayStatus};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
pub struct RelayStats {
    pub reqs: usize,
    pub closes: usize,
    pub events: usize,
}

struct LiveSub {
    sub_id: String,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Clone)]
pub struct TestRelay {
    pub url: String,
    store: Arc<Mutex<Vec<Note>>>,
    stats: Arc<Mutex<RelayStats>>,
    subs: Arc<Mutex<Vec<LiveSub>>>,
    /// When false the relay reads frames but never answers.
    responsive: bool,
}

impl TestRelay {
    pub async fn start() -> TestRelay {
        TestRelay::start_inner(true).await
    }

    /// A relay that accepts the socket but never sends anything back.
    pub async fn start_silent() -> TestRelay {
        TestRelay::start_inner(false).await
    }

    async fn start_inner(responsive: bool) -> TestRelay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = TestRelay {
            url: format!("ws://{}", addr),
            store: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Mutex::new(RelayStats::default())),
            subs: Arc::new(Mutex::new(Vec::new())),
            responsive,
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

    pub fn seed(&self, note: Note) {
        self.store.lock().unwrap().push(note);
    }

    pub fn stats<R>(&self, f: impl FnOnce(&RelayStats) -> R) -> R {
        f(&self.stats.lock().unwrap())
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
                    Some(Ok(Message::Text(txt))) => {
                        if self.responsive {
                            self.handle_frame(txt.as_str(), &tx);
                        }
                    }
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
                self.stats.lock().unwrap().events += 1;
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
                self.stats.lock().unwrap().reqs += 1;

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
                self.stats.lock().unwrap().closes += 1;
                self.subs.lock().unwrap().retain(|s| s.sub_id != sub_id);
            }
            _ => {}
        }
    }
}

/// Poll until every relay in the pool reports connected.
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
