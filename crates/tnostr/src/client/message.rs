use crate::{Error, Filter, Note};
use serde_json::json;

/// Messages sent by clients, received by relays
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Note),
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: String,
    },
    Raw(String),
}

impl ClientMessage {
    pub fn event(note: Note) -> Self {
        ClientMessage::Event(note)
    }

    pub fn req(sub_id: String, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: String) -> Self {
        ClientMessage::Close { sub_id }
    }

    pub fn raw(raw: String) -> Self {
        ClientMessage::Raw(raw)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(match self {
            Self::Event(note) => format!("[\"EVENT\",{}]", note.to_json()?),
            Self::Req { sub_id, filters } => {
                if filters.is_empty() {
                    format!("[\"REQ\",\"{}\",{{}}]", sub_id)
                } else {
                    let filters_json: Result<Vec<String>, Error> =
                        filters.iter().map(|f| f.to_json()).collect();
                    format!("[\"REQ\",\"{}\",{}]", sub_id, filters_json?.join(","))
                }
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
            Self::Raw(raw) => raw.clone(),
        })
    }
}
