use crate::relay::message::{CommandResult, RelayMessage};
use crate::{ClientMessage, Note};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub mod message;
pub mod pool;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RelayStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// Update delivered to a subscription channel.
#[derive(Debug, Clone)]
pub(crate) enum SubUpdate {
    Note { relay: Arc<str>, note: Note },
    Eose { relay: Arc<str> },
}

pub(crate) struct SubEntry {
    /// REQ frame re-sent on every (re)connect.
    pub req_frame: String,
    pub tx: mpsc::UnboundedSender<SubUpdate>,
}

pub(crate) type SubRegistry = Arc<Mutex<HashMap<String, SubEntry>>>;

pub(crate) enum RelayCmd {
    Frame(String),
    Publish {
        frame: String,
        event_id: String,
        ack: oneshot::Sender<CommandResult>,
    },
}

/// Cheap cloneable handle to a spawned relay actor. The actor owns the
/// socket, reconnects with backoff, re-issues open subscriptions after a
/// reconnect, and routes inbound frames.
#[derive(Clone)]
pub struct Relay {
    pub url: Arc<str>,
    cmd: mpsc::UnboundedSender<RelayCmd>,
    status: Arc<Mutex<RelayStatus>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.url)
            .field("status", &self.status())
            .finish()
    }
}

impl Relay {
    pub(crate) fn spawn(url: String, subs: SubRegistry) -> Self {
        let url: Arc<str> = url.into();
        let (cmd, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(RelayStatus::Connecting));

        tokio::spawn(run_relay(url.clone(), rx, subs, status.clone()));

        Relay { url, cmd, status }
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn send_frame(&self, frame: String) {
        let _ = self.cmd.send(RelayCmd::Frame(frame));
    }

    pub(crate) fn send(&self, msg: &ClientMessage) {
        match msg.to_json() {
            Ok(json) => {
                debug!("sending {} to {}", json, self.url);
                self.send_frame(json);
            }
            Err(e) => warn!("error serializing client message: {e}"),
        }
    }

    pub(crate) fn publish(
        &self,
        frame: String,
        event_id: String,
        ack: oneshot::Sender<CommandResult>,
    ) {
        let _ = self.cmd.send(RelayCmd::Publish {
            frame,
            event_id,
            ack,
        });
    }
}

fn initial_reconnect_duration() -> Duration {
    Duration::from_secs(5)
}

fn set_status(status: &Arc<Mutex<RelayStatus>>, new: RelayStatus) {
    *status.lock().unwrap_or_else(|e| e.into_inner()) = new;
}

async fn run_relay(
    url: Arc<str>,
    mut rx: mpsc::UnboundedReceiver<RelayCmd>,
    subs: SubRegistry,
    status: Arc<Mutex<RelayStatus>>,
) {
    let mut retry_after = initial_reconnect_duration();

    loop {
        set_status(&status, RelayStatus::Connecting);

        match connect_async(&*url).await {
            Ok((ws, _)) => {
                info!("relay connected: {}", url);
                set_status(&status, RelayStatus::Connected);
                retry_after = initial_reconnect_duration();

                let (mut write, mut read) = ws.split();
                resubscribe(&url, &mut write, &subs).await;

                let finished = serve_connection(&url, &mut write, &mut read, &mut rx, &subs).await;
                let _ = write.close().await;
                set_status(&status, RelayStatus::Disconnected);
                if finished {
                    return;
                }
            }
            Err(e) => {
                warn!("relay connect failed: {}: {}", url, e);
                set_status(&status, RelayStatus::Disconnected);
            }
        }

        if rx.is_closed() {
            // pool dropped while we were down, nothing to reconnect for
            return;
        }
        tokio::time::sleep(retry_after).await;
        let next = Duration::from_millis(((retry_after.as_millis() as f64) * 1.5) as u64);
        debug!(
            "bumping reconnect duration from {:?} to {:?} and retrying connect",
            retry_after, next
        );
        retry_after = next;
    }
}

async fn resubscribe(url: &Arc<str>, write: &mut WsSink, subs: &SubRegistry) {
    let frames: Vec<String> = {
        let subs = subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.values().map(|entry| entry.req_frame.clone()).collect()
    };
    for frame in frames {
        debug!("resubscribing on {}: {}", url, frame);
        if write.send(WsMessage::text(frame)).await.is_err() {
            break;
        }
    }
}

/// Returns true when the command channel closed and the actor should exit
/// for good, false on connection loss.
async fn serve_connection(
    url: &Arc<str>,
    write: &mut WsSink,
    read: &mut WsSource,
    rx: &mut mpsc::UnboundedReceiver<RelayCmd>,
    subs: &SubRegistry,
) -> bool {
    let mut pending_oks: HashMap<String, oneshot::Sender<CommandResult>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                None => return true,
                Some(RelayCmd::Frame(frame)) => {
                    if write.send(WsMessage::text(frame)).await.is_err() {
                        return false;
                    }
                }
                Some(RelayCmd::Publish { frame, event_id, ack }) => {
                    pending_oks.insert(event_id, ack);
                    if write.send(WsMessage::text(frame)).await.is_err() {
                        return false;
                    }
                }
            },
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(txt))) => {
                    handle_frame(url, txt.as_str(), subs, &mut pending_oks);
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    warn!("relay closed: {}", url);
                    return false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("relay read failed: {}: {}", url, e);
                    return false;
                }
            },
        }
    }
}

fn handle_frame(
    url: &Arc<str>,
    frame: &str,
    subs: &SubRegistry,
    pending_oks: &mut HashMap<String, oneshot::Sender<CommandResult>>,
) {
    let msg = match RelayMessage::from_json(frame) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("undecodable frame from {}: {}", url, e);
            return;
        }
    };

    match msg {
        RelayMessage::Event { sub_id, note } => {
            if let Err(e) = note.verify() {
                warn!("dropping invalid event from {}: {}", url, e);
                return;
            }
            let subs = subs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = subs.get(&sub_id) {
                let _ = entry.tx.send(SubUpdate::Note {
                    relay: url.clone(),
                    note,
                });
            }
        }
        RelayMessage::Eose(sub_id) => {
            let subs = subs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = subs.get(&sub_id) {
                let _ = entry.tx.send(SubUpdate::Eose { relay: url.clone() });
            }
        }
        RelayMessage::Ok(result) => {
            if let Some(ack) = pending_oks.remove(&result.event_id) {
                let _ = ack.send(result);
            } else {
                debug!("unsolicited OK from {}: {:?}", url, result);
            }
        }
        RelayMessage::Notice(notice) => {
            info!("notice from {}: {}", url, notice);
        }
    }
}
