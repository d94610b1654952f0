use crate::{Note, NoteId, Pubkey};
use serde::{Deserialize, Serialize};

/// Relay query descriptor, used for one-shot fetches and subscriptions.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Default)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#e")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
    #[serde(rename = "#p")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u16>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = NoteId>) -> Self {
        self.ids = Some(ids.into_iter().map(|id| id.hex()).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = Pubkey>) -> Self {
        self.authors = Some(authors.into_iter().map(|pk| pk.hex()).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn event(mut self, id: NoteId) -> Self {
        self.events.get_or_insert_with(Vec::new).push(id.hex());
        self
    }

    pub fn pubkey(mut self, pk: Pubkey) -> Self {
        self.pubkeys.get_or_insert_with(Vec::new).push(pk.hex());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u16) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Local predicate mirroring relay-side matching. `limit` is a
    /// result-count bound, not a per-note predicate, so it is ignored
    /// here.
    pub fn matches(&self, note: &Note) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == note.id.hex()) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == note.pubkey.hex()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&note.kind) {
                return false;
            }
        }
        if let Some(events) = &self.events {
            if !note.tag_values("e").any(|v| events.iter().any(|e| e == v)) {
                return false;
            }
        }
        if let Some(pubkeys) = &self.pubkeys {
            if !note.tag_values("p").any(|v| pubkeys.iter().any(|p| p == v)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if note.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if note.created_at > until {
                return false;
            }
        }
        true
    }
}
