use crate::relay::{Relay, RelayStatus, SubEntry, SubRegistry, SubUpdate};
use crate::{ClientMessage, Filter, Note, NoteId, Result};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// Per-relay publish status. A relay that rejected or never answered is
/// reported here, not surfaced as a hard failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelayAck {
    pub relay: String,
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound for fetches and publish acks. A relay that never
    /// answers degrades to "missing from this result set".
    pub max_wait: Duration,
    /// Lifetime of an in-flight query cache entry. Entries lapse after
    /// this window whether or not they were ever hit again.
    pub coalesce_window: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_wait: Duration::from_secs(4),
            coalesce_window: Duration::from_secs(3),
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Vec<Note>>>;

struct Inflight {
    started: Instant,
    fut: SharedFetch,
}

/// A set of relay connections queried and published to as one unit.
pub struct RelayPool {
    relays: Vec<Relay>,
    subs: SubRegistry,
    inflight: Mutex<HashMap<String, Inflight>>,
    cfg: PoolConfig,
}

impl Default for RelayPool {
    fn default() -> Self {
        RelayPool::new(PoolConfig::default())
    }
}

impl RelayPool {
    pub fn new(cfg: PoolConfig) -> Self {
        RelayPool {
            relays: Vec::new(),
            subs: Arc::new(Mutex::new(HashMap::new())),
            inflight: Mutex::new(HashMap::new()),
            cfg,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    pub fn has(&self, url: &str) -> bool {
        self.relays.iter().any(|r| &*r.url == url)
    }

    pub fn urls(&self) -> BTreeSet<String> {
        self.relays.iter().map(|r| r.url.to_string()).collect()
    }

    pub fn statuses(&self) -> Vec<(String, RelayStatus)> {
        self.relays
            .iter()
            .map(|r| (r.url.to_string(), r.status()))
            .collect()
    }

    // standardize the format (ie, trailing slashes) to avoid dups
    fn canonicalize_url(url: &str) -> String {
        match Url::parse(url) {
            Ok(parsed_url) => parsed_url.to_string(),
            Err(_) => url.to_owned(),
        }
    }

    pub fn add_url(&mut self, url: &str) {
        let url = Self::canonicalize_url(url);
        if self.has(&url) {
            return;
        }
        self.relays.push(Relay::spawn(url, self.subs.clone()));
    }

    pub fn add_urls(&mut self, urls: impl IntoIterator<Item = String>) {
        for url in urls {
            self.add_url(&url);
        }
    }

    /// Send an EVENT to every relay and gather per-relay OK status.
    /// Failures stay per-relay; callers decide what total failure means.
    pub async fn publish(&self, note: &Note) -> Result<Vec<RelayAck>> {
        let frame = ClientMessage::event(note.clone()).to_json()?;
        let event_id = note.id.hex();
        let max_wait = self.cfg.max_wait;

        let waits = self.relays.iter().map(|relay| {
            let frame = frame.clone();
            let event_id = event_id.clone();
            async move {
                let (tx, rx) = oneshot::channel();
                relay.publish(frame, event_id, tx);
                match tokio::time::timeout(max_wait, rx).await {
                    Ok(Ok(result)) => RelayAck {
                        relay: relay.url.to_string(),
                        accepted: result.accepted,
                        message: result.message,
                    },
                    Ok(Err(_)) => RelayAck {
                        relay: relay.url.to_string(),
                        accepted: false,
                        message: "connection lost".to_owned(),
                    },
                    Err(_) => RelayAck {
                        relay: relay.url.to_string(),
                        accepted: false,
                        message: "timed out".to_owned(),
                    },
                }
            }
        });

        Ok(futures_util::future::join_all(waits).await)
    }

    /// Query every relay and collect results until each one signals
    /// end-of-stored-events or `max_wait` elapses. Results are
    /// deduplicated by id, first seen wins; no time ordering is implied.
    /// Concurrent identical queries within the coalescing window share a
    /// single round trip.
    pub async fn fetch_all(&self, filters: Vec<Filter>) -> Vec<Note> {
        let key = match self.inflight_key(&filters) {
            Ok(key) => key,
            Err(_) => return Vec::new(),
        };

        let fut = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            let window = self.cfg.coalesce_window;
            inflight.retain(|_, entry| entry.started.elapsed() < window);

            if let Some(entry) = inflight.get(&key) {
                debug!("coalescing fetch into in-flight query: {}", key);
                entry.fut.clone()
            } else {
                let fut = collect_query(
                    self.relays.clone(),
                    self.subs.clone(),
                    filters,
                    self.cfg.max_wait,
                )
                .boxed()
                .shared();
                inflight.insert(
                    key,
                    Inflight {
                        started: Instant::now(),
                        fut: fut.clone(),
                    },
                );
                fut
            }
        };

        fut.await
    }

    /// Resolve a filter to a single event. `None` means no relay
    /// produced a match within the bounded wait.
    pub async fn fetch_one(&self, filter: Filter) -> Option<Note> {
        if self.relays.is_empty() {
            return None;
        }
        let (sub_id, mut rx) = open_query(&self.relays, &self.subs, vec![filter]).ok()?;

        let mut eosed: HashSet<Arc<str>> = HashSet::new();
        let total = self.relays.len();
        let deadline = tokio::time::sleep(self.cfg.max_wait);
        tokio::pin!(deadline);

        let mut found = None;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                update = rx.recv() => match update {
                    None => break,
                    Some(SubUpdate::Note { note, .. }) => {
                        found = Some(note);
                        break;
                    }
                    Some(SubUpdate::Eose { relay }) => {
                        eosed.insert(relay);
                        if eosed.len() >= total {
                            break;
                        }
                    }
                },
            }
        }

        close_query(&self.relays, &self.subs, &sub_id);
        found
    }

    /// Open a streaming subscription. The returned handle closes the
    /// relay-side subscriptions when cancelled or dropped.
    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<Subscription> {
        let (sub_id, rx) = open_query(&self.relays, &self.subs, filters)?;
        Ok(Subscription {
            sub_id,
            rx,
            relays: self.relays.clone(),
            subs: self.subs.clone(),
            closed: false,
        })
    }

    fn inflight_key(&self, filters: &[Filter]) -> Result<String> {
        let filters_json: Result<Vec<String>> = filters.iter().map(|f| f.to_json()).collect();
        let mut key = self.urls().into_iter().collect::<Vec<_>>().join(",");
        key.push('|');
        key.push_str(&filters_json?.join(","));
        Ok(key)
    }
}

fn open_query(
    relays: &[Relay],
    subs: &SubRegistry,
    filters: Vec<Filter>,
) -> Result<(String, mpsc::UnboundedReceiver<SubUpdate>)> {
    let sub_id = Uuid::new_v4().to_string();
    let req_frame = ClientMessage::req(sub_id.clone(), filters).to_json()?;
    let (tx, rx) = mpsc::unbounded_channel();

    subs.lock().unwrap_or_else(|e| e.into_inner()).insert(
        sub_id.clone(),
        SubEntry {
            req_frame: req_frame.clone(),
            tx,
        },
    );
    for relay in relays {
        relay.send_frame(req_frame.clone());
    }
    Ok((sub_id, rx))
}

fn close_query(relays: &[Relay], subs: &SubRegistry, sub_id: &str) {
    subs.lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(sub_id);
    for relay in relays {
        relay.send(&ClientMessage::close(sub_id.to_owned()));
    }
}

async fn collect_query(
    relays: Vec<Relay>,
    subs: SubRegistry,
    filters: Vec<Filter>,
    max_wait: Duration,
) -> Vec<Note> {
    if relays.is_empty() {
        return Vec::new();
    }
    let (sub_id, mut rx) = match open_query(&relays, &subs, filters) {
        Ok(opened) => opened,
        Err(e) => {
            debug!("failed to open query: {e}");
            return Vec::new();
        }
    };

    let mut seen: HashSet<NoteId> = HashSet::new();
    let mut notes = Vec::new();
    let mut eosed: HashSet<Arc<str>> = HashSet::new();
    let deadline = tokio::time::sleep(max_wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            update = rx.recv() => match update {
                None => break,
                Some(SubUpdate::Note { note, .. }) => {
                    if seen.insert(note.id) {
                        notes.push(note);
                    }
                }
                Some(SubUpdate::Eose { relay }) => {
                    eosed.insert(relay);
                    if eosed.len() >= relays.len() {
                        break;
                    }
                }
            },
        }
    }

    close_query(&relays, &subs, &sub_id);
    notes
}

/// Streaming query handle. Dropping it closes the underlying relay
/// subscriptions.
pub struct Subscription {
    sub_id: String,
    rx: mpsc::UnboundedReceiver<SubUpdate>,
    relays: Vec<Relay>,
    subs: SubRegistry,
    closed: bool,
}

impl Subscription {
    pub fn sub_id(&self) -> &str {
        &self.sub_id
    }

    /// Next event from any relay, in delivery order. Duplicates across
    /// relays are not collapsed here; streaming callers dedup as needed.
    pub async fn next_note(&mut self) -> Option<Note> {
        while let Some(update) = self.rx.recv().await {
            if let SubUpdate::Note { note, .. } = update {
                return Some(note);
            }
        }
        None
    }

    pub fn cancel(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        close_query(&self.relays, &self.subs, &self.sub_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close_inner();
    }
}
