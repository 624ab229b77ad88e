//! NIP-01 subscription filters: JSON form and local matching.
//!
//! The same filter that goes out in a `REQ` is used to re-check every event a
//! relay claims matches it. Relays are untrusted, so a delivered event is only
//! accepted when [`Filter::matches`] agrees.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{
    error::{Error, Result},
    event::Event,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<String>>,
    pub authors: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u32>>,
    /// Tag constraints keyed by single-letter tag name (without the `#`).
    pub tags: BTreeMap<char, BTreeSet<String>>,
    /// Lower bound for `created_at`, inclusive.
    pub since: Option<u64>,
    /// Upper bound for `created_at`, inclusive.
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .insert(author.into());
        self
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    /// Require a tag named `name` carrying `value`.
    pub fn tag(mut self, name: char, value: impl Into<String>) -> Self {
        self.tags.entry(name).or_default().insert(value.into());
        self
    }

    /// `#e` constraint: events referencing `event_id`.
    pub fn event_ref(self, event_id: impl Into<String>) -> Self {
        self.tag('e', event_id)
    }

    /// `#d` constraint: events carrying identifier `d`.
    pub fn identifier(self, d: impl Into<String>) -> Self {
        self.tag('d', d)
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject filters that no well-behaved relay would accept.
    pub fn validate(&self) -> Result<()> {
        for id in self.ids.iter().flatten() {
            check_hex64("ids", id)?;
        }
        for author in self.authors.iter().flatten() {
            check_hex64("authors", author)?;
        }
        for name in self.tags.keys() {
            if !name.is_ascii_alphabetic() {
                return Err(Error::validation(format!(
                    "tag filter key must be a single letter, got {name:?}"
                )));
            }
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(Error::validation(format!(
                    "since ({since}) is after until ({until})"
                )));
            }
        }
        Ok(())
    }

    /// Whether `ev` satisfies every constraint in the filter.
    ///
    /// `limit` only bounds stored results on the relay and is ignored here.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let name = name.to_string();
            if !ev.tag_values(&name).any(|v| values.contains(v)) {
                return false;
            }
        }
        self.since.map_or(true, |s| ev.created_at >= s)
            && self.until.map_or(true, |u| ev.created_at <= u)
    }

    /// Render the NIP-01 JSON object sent in `REQ`.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = &self.kinds {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (name, values) in &self.tags {
            map.insert(format!("#{name}"), strings(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        map
    }

    /// Parse a NIP-01 filter object.
    ///
    /// Unlike a lenient relay, this rejects ill-typed fields and unknown keys
    /// instead of skipping them, then runs [`Filter::validate`].
    pub fn from_value(val: &Value) -> Result<Self> {
        let obj = val
            .as_object()
            .ok_or_else(|| Error::validation("filter must be a JSON object"))?;
        let mut filter = Filter::new();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_set(key, v)?),
                "authors" => filter.authors = Some(string_set(key, v)?),
                "kinds" => {
                    let arr = v
                        .as_array()
                        .ok_or_else(|| Error::validation("kinds must be an array"))?;
                    let kinds = arr
                        .iter()
                        .map(|k| {
                            k.as_u64()
                                .and_then(|k| u32::try_from(k).ok())
                                .ok_or_else(|| Error::validation(format!("invalid kind {k}")))
                        })
                        .collect::<Result<_>>()?;
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(timestamp(key, v)?),
                "until" => filter.until = Some(timestamp(key, v)?),
                "limit" => filter.limit = Some(timestamp(key, v)? as usize),
                other => {
                    let mut chars = other.strip_prefix('#').unwrap_or_default().chars();
                    match (chars.next(), chars.next()) {
                        (Some(name), None) => {
                            filter.tags.insert(name, string_set(key, v)?);
                        }
                        _ => {
                            return Err(Error::validation(format!("unknown filter key {other:?}")))
                        }
                    }
                }
            }
        }
        filter.validate()?;
        Ok(filter)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let val = Value::deserialize(deserializer)?;
        Filter::from_value(&val).map_err(serde::de::Error::custom)
    }
}

fn strings(set: &BTreeSet<String>) -> Value {
    Value::Array(set.iter().cloned().map(Value::String).collect())
}

fn string_set(key: &str, v: &Value) -> Result<BTreeSet<String>> {
    let arr = v
        .as_array()
        .ok_or_else(|| Error::validation(format!("{key} must be an array")))?;
    arr.iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::validation(format!("{key} must contain strings")))
        })
        .collect()
}

fn timestamp(key: &str, v: &Value) -> Result<u64> {
    v.as_u64()
        .ok_or_else(|| Error::validation(format!("{key} must be a non-negative integer")))
}

fn check_hex64(field: &str, s: &str) -> Result<()> {
    let ok = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "{field} entries must be 64 lowercase hex characters, got {s:?}"
        )))
    }
}
