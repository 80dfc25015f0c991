//! NIP-01 wire frames and subscription filters.
//!
//! Every frame is a JSON array whose first element names it. Outbound frames
//! are [`ClientMessage`]s (`EVENT`, `REQ`, `CLOSE`); inbound frames parse into
//! [`RelayMessage`]s (`EVENT`, `OK`, `EOSE`, `CLOSED`, `NOTICE`).
//!
//! [`Filter`] validation lives here too. It is the only check made before a
//! subscription is registered.

use crate::event::Event;
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("frame is not a JSON array: {0}")]
    NotAnArray(String),

    #[error("frame has no type tag")]
    Untagged,

    #[error("unsupported frame type {0:?}")]
    UnknownType(String),

    #[error("{frame} frame: {field} missing or mistyped")]
    BadField {
        frame: &'static str,
        field: &'static str,
    },

    #[error("{frame} frame carries an invalid event: {source}")]
    InvalidEvent {
        frame: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reasons a filter is rejected before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("filter must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("malformed filter: {0}")]
    Malformed(String),

    #[error("{field}[{index}] is not a 64-character lowercase hex string")]
    InvalidHex { field: &'static str, index: usize },

    #[error("invalid tag filter key {0:?}, expected '#' followed by a single letter")]
    InvalidTagKey(String),

    #[error("since ({since}) is after until ({until})")]
    InvalidRange { since: u64, until: u64 },

    #[error("at least one filter is required")]
    NoFilters,
}

/// Client to relay frame.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        ClientMessage::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        ClientMessage::Close {
            subscription_id: subscription_id.into(),
        }
    }

    /// Frame type tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close { .. } => "CLOSE",
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Serialize for ClientMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ClientMessage::Event(event) => {
                let mut frame = serializer.serialize_seq(Some(2))?;
                frame.serialize_element(self.kind())?;
                frame.serialize_element(event)?;
                frame.end()
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = serializer.serialize_seq(Some(filters.len() + 2))?;
                frame.serialize_element(self.kind())?;
                frame.serialize_element(subscription_id)?;
                for filter in filters {
                    frame.serialize_element(filter)?;
                }
                frame.end()
            }
            ClientMessage::Close { subscription_id } => {
                let mut frame = serializer.serialize_seq(Some(2))?;
                frame.serialize_element(self.kind())?;
                frame.serialize_element(subscription_id)?;
                frame.end()
            }
        }
    }
}

/// Relay to client frame.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// A stored or live event matching a subscription
    Event {
        subscription_id: String,
        event: Event,
    },
    /// Verdict on a published event
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },
    /// The relay has sent every stored event for the subscription
    Eose { subscription_id: String },
    /// The relay ended the subscription on its side
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice { message: String },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::NotAnArray(e.to_string()))?;
        let mut elements = frame.into_iter();
        let tag = match elements.next() {
            Some(Value::String(tag)) => tag,
            _ => return Err(MessageError::Untagged),
        };

        match tag.as_str() {
            "EVENT" => {
                let mut fields = Fields::new("EVENT", elements);
                Ok(RelayMessage::Event {
                    subscription_id: fields.string("subscription id")?,
                    event: fields.event()?,
                })
            }
            "OK" => {
                let mut fields = Fields::new("OK", elements);
                Ok(RelayMessage::Ok {
                    event_id: fields.string("event id")?,
                    success: fields.boolean("accepted flag")?,
                    message: fields.string_or_empty(),
                })
            }
            "EOSE" => {
                let mut fields = Fields::new("EOSE", elements);
                Ok(RelayMessage::Eose {
                    subscription_id: fields.string("subscription id")?,
                })
            }
            "CLOSED" => {
                let mut fields = Fields::new("CLOSED", elements);
                Ok(RelayMessage::Closed {
                    subscription_id: fields.string("subscription id")?,
                    message: fields.string_or_empty(),
                })
            }
            "NOTICE" => {
                let mut fields = Fields::new("NOTICE", elements);
                Ok(RelayMessage::Notice {
                    message: fields.string("message")?,
                })
            }
            _ => Err(MessageError::UnknownType(tag)),
        }
    }

    /// Subscription this frame is addressed to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            RelayMessage::Ok { .. } | RelayMessage::Notice { .. } => None,
        }
    }
}

/// Positional reader over the elements after the type tag.
struct Fields {
    frame: &'static str,
    elements: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(frame: &'static str, elements: std::vec::IntoIter<Value>) -> Self {
        Self { frame, elements }
    }

    fn bad(&self, field: &'static str) -> MessageError {
        MessageError::BadField {
            frame: self.frame,
            field,
        }
    }

    fn string(&mut self, field: &'static str) -> Result<String, MessageError> {
        match self.elements.next() {
            Some(Value::String(value)) => Ok(value),
            _ => Err(self.bad(field)),
        }
    }

    /// Trailing human-readable text some relays omit.
    fn string_or_empty(&mut self) -> String {
        match self.elements.next() {
            Some(Value::String(value)) => value,
            _ => String::new(),
        }
    }

    fn boolean(&mut self, field: &'static str) -> Result<bool, MessageError> {
        match self.elements.next() {
            Some(Value::Bool(value)) => Ok(value),
            _ => Err(self.bad(field)),
        }
    }

    fn event(&mut self) -> Result<Event, MessageError> {
        let value = self.elements.next().ok_or_else(|| self.bad("event"))?;
        serde_json::from_value(value).map_err(|source| MessageError::InvalidEvent {
            frame: self.frame,
            source,
        })
    }
}

/// NIP-01 subscription filter. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Hex public keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Inclusive lower bound on `created_at`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Inclusive upper bound on `created_at`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Cap on stored events returned before EOSE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag conditions keyed `#<letter>`, e.g. `#e` or `#t`
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a filter from an untyped JSON value, rejecting anything that
    /// is not a well-formed filter object.
    pub fn from_value(value: Value) -> Result<Self, FilterError> {
        let shape = match &value {
            Value::Object(_) => None,
            Value::Null => Some("null"),
            Value::Bool(_) => Some("a boolean"),
            Value::Number(_) => Some("a number"),
            Value::String(_) => Some("a string"),
            Value::Array(_) => Some("an array"),
        };
        if let Some(shape) = shape {
            return Err(FilterError::NotAnObject(shape));
        }

        let filter: Filter =
            serde_json::from_value(value).map_err(|e| FilterError::Malformed(e.to_string()))?;
        filter.validate()?;
        Ok(filter)
    }

    /// Check field contents that the type system does not.
    pub fn validate(&self) -> Result<(), FilterError> {
        if let Some(ids) = &self.ids {
            check_hex_list("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            check_hex_list("authors", authors)?;
        }
        for key in self.tags.keys() {
            let mut chars = key.chars();
            let valid = chars.next() == Some('#')
                && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.next().is_none();
            if !valid {
                return Err(FilterError::InvalidTagKey(key.clone()));
            }
        }
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(FilterError::InvalidRange { since, until });
        }
        Ok(())
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Match events carrying tag `letter` with any of `values`.
    pub fn tag(mut self, letter: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", letter.into()), values);
        self
    }
}

/// Validate a whole filter list as sent in one REQ.
pub fn validate_filters(filters: &[Filter]) -> Result<(), FilterError> {
    if filters.is_empty() {
        return Err(FilterError::NoFilters);
    }
    filters.iter().try_for_each(Filter::validate)
}

fn check_hex_list(field: &'static str, values: &[String]) -> Result<(), FilterError> {
    match values.iter().position(|v| !is_hex64(v)) {
        Some(index) => Err(FilterError::InvalidHex { field, index }),
        None => Ok(()),
    }
}

fn is_hex64(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
