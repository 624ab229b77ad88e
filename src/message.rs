//! Wire frames exchanged with relays.
//!
//! Every frame is a JSON array whose first element names its type. Decoding
//! checks the type tag, arity and element types up front and reports anything
//! else as [`Error::Protocol`].

use serde_json::{json, Value};

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
};

/// Frames a client sends to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", event]`
    Event(Event),
    /// `["REQ", sub_id, filter, ...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", sub_id]`
    Close(String),
}

/// Frames a relay sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", sub_id, event]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["EOSE", sub_id]`: stored events are exhausted, live delivery follows.
    EndOfStoredEvents(String),
    /// `["OK", event_id, accepted, message]`; the message may be absent.
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["NOTICE", message]`
    Notice(String),
    /// `["CLOSED", sub_id, message]`: the relay ended a subscription.
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl ClientMessage {
    pub fn as_json(&self) -> String {
        match self {
            ClientMessage::Event(ev) => json!(["EVENT", ev]).to_string(),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                arr.extend(filters.iter().map(|f| Value::Object(f.to_json())));
                Value::Array(arr).to_string()
            }
            ClientMessage::Close(sub) => json!(["CLOSE", sub]).to_string(),
        }
    }

    /// Decode a client frame, as a relay would.
    pub fn from_json(text: &str) -> Result<Self> {
        let arr = frame_array(text)?;
        match type_tag(&arr)? {
            "EVENT" => {
                arity(&arr, 2)?;
                Ok(ClientMessage::Event(event_at(&arr, 1)?))
            }
            "REQ" => {
                if arr.len() < 3 {
                    return Err(Error::protocol("REQ needs at least one filter"));
                }
                let filters = arr[2..]
                    .iter()
                    .map(|v| Filter::from_value(v).map_err(|e| Error::protocol(e.to_string())))
                    .collect::<Result<_>>()?;
                Ok(ClientMessage::Req {
                    subscription_id: str_at(&arr, 1)?,
                    filters,
                })
            }
            "CLOSE" => {
                arity(&arr, 2)?;
                Ok(ClientMessage::Close(str_at(&arr, 1)?))
            }
            other => Err(Error::protocol(format!("unknown client frame type {other:?}"))),
        }
    }
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        let arr = frame_array(text)?;
        match type_tag(&arr)? {
            "EVENT" => {
                arity(&arr, 3)?;
                Ok(RelayMessage::Event {
                    subscription_id: str_at(&arr, 1)?,
                    event: event_at(&arr, 2)?,
                })
            }
            "EOSE" => {
                arity(&arr, 2)?;
                Ok(RelayMessage::EndOfStoredEvents(str_at(&arr, 1)?))
            }
            "OK" => {
                // Older relays omit the message.
                if arr.len() != 3 {
                    arity(&arr, 4)?;
                }
                let accepted = arr[2]
                    .as_bool()
                    .ok_or_else(|| Error::protocol("OK status must be a boolean"))?;
                let message = if arr.len() == 4 {
                    str_at(&arr, 3)?
                } else {
                    String::new()
                };
                Ok(RelayMessage::Ok {
                    event_id: str_at(&arr, 1)?,
                    accepted,
                    message,
                })
            }
            "NOTICE" => {
                arity(&arr, 2)?;
                Ok(RelayMessage::Notice(str_at(&arr, 1)?))
            }
            "CLOSED" => {
                arity(&arr, 3)?;
                Ok(RelayMessage::Closed {
                    subscription_id: str_at(&arr, 1)?,
                    message: str_at(&arr, 2)?,
                })
            }
            other => Err(Error::protocol(format!("unknown relay frame type {other:?}"))),
        }
    }

    pub fn as_json(&self) -> String {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]).to_string(),
            RelayMessage::EndOfStoredEvents(sub) => json!(["EOSE", sub]).to_string(),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]).to_string(),
            RelayMessage::Notice(msg) => json!(["NOTICE", msg]).to_string(),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]).to_string(),
        }
    }
}

fn frame_array(text: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(arr)) => Ok(arr),
        Ok(_) => Err(Error::protocol("frame is not a JSON array")),
        Err(e) => Err(Error::protocol(format!("frame is not JSON: {e}"))),
    }
}

fn type_tag(arr: &[Value]) -> Result<&str> {
    arr.first()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("frame has no type tag"))
}

fn arity(arr: &[Value], expected: usize) -> Result<()> {
    if arr.len() != expected {
        return Err(Error::protocol(format!(
            "{} frame has {} elements, expected {expected}",
            arr.first().and_then(Value::as_str).unwrap_or("?"),
            arr.len()
        )));
    }
    Ok(())
}

fn str_at(arr: &[Value], idx: usize) -> Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::protocol(format!("element {idx} must be a string")))
}

fn event_at(arr: &[Value], idx: usize) -> Result<Event> {
    let val = arr
        .get(idx)
        .cloned()
        .ok_or_else(|| Error::protocol("missing event"))?;
    serde_json::from_value(val).map_err(|e| Error::protocol(format!("malformed event: {e}")))
}
