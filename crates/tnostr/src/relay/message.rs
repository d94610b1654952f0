use crate::{Error, Note, Result};
use serde_json::Value;

/// Publish acknowledgment carried by an OK frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResult {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Messages sent by relays, received by clients.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// ["EVENT", subid, event]
    Event { sub_id: String, note: Note },
    /// ["EOSE", subid]
    Eose(String),
    /// ["OK", event id, accepted, message]
    Ok(CommandResult),
    /// ["NOTICE", message]
    Notice(String),
}

impl RelayMessage {
    pub fn from_json(msg: &str) -> Result<RelayMessage> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        let value: Value = serde_json::from_str(msg)?;
        let arr = value
            .as_array()
            .ok_or_else(|| Error::DecodeFailed("not a json array".into()))?;
        let tag = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::DecodeFailed("missing message type".into()))?;

        match tag {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(Error::DecodeFailed("invalid EVENT format".into()));
                }
                let sub_id = arr[1]
                    .as_str()
                    .ok_or_else(|| Error::DecodeFailed("invalid subscription id".into()))?
                    .to_owned();
                let note: Note = serde_json::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event { sub_id, note })
            }
            "EOSE" => {
                let sub_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::DecodeFailed("invalid subscription id".into()))?;
                Ok(RelayMessage::Eose(sub_id.to_owned()))
            }
            "OK" => {
                let event_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::DecodeFailed("invalid OK event id".into()))?;
                let accepted = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| Error::DecodeFailed("bad boolean value".into()))?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or_default();
                Ok(RelayMessage::Ok(CommandResult {
                    event_id: event_id.to_owned(),
                    accepted,
                    message: message.to_owned(),
                }))
            }
            "NOTICE" => {
                let notice = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::DecodeFailed("invalid NOTICE format".into()))?;
                Ok(RelayMessage::Notice(notice.to_owned()))
            }
            other => Err(Error::DecodeFailed(format!(
                "unrecognized message type: '{other}'"
            ))),
        }
    }
}
