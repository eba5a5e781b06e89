//! Step parameter sets
//!
//! A [`ParameterSet`] is what a content step receives on its command line.
//! The master builds one per step by merging the step's defaults with the
//! caller's overrides, then encodes it as `key='value'` tokens. The content
//! step parses those tokens back and decodes them into its own typed schema.

use crate::error::ParameterError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Keys that are always parsed as booleans on the command line
const FLAG_KEYS: &[&str] = &["noreboot", "sourceiss3bucket"];

/// A single parameter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Text(String),
    List(Vec<String>),
    /// List of string records, e.g. repository definitions
    Records(Vec<BTreeMap<String, String>>),
}

impl Value {
    /// Encode for the step command line.
    ///
    /// Lists become `[a,b,c]` and records become a JSON array; the step is
    /// responsible for decoding these back.
    pub fn encode(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Text(s) => s.clone(),
            Value::List(items) => format!("[{}]", items.join(",")),
            Value::Records(records) => {
                serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Text(s) => parse_bool(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items)
    }
}

impl From<Vec<BTreeMap<String, String>>> for Value {
    fn from(records: Vec<BTreeMap<String, String>>) -> Self {
        Value::Records(records)
    }
}

/// Single-quote escaping rules of the shell that parses step arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    /// `'` closes, escapes and reopens: `'\''`
    Posix,
    /// `'` is doubled: `''`
    PowerShell,
}

impl Quoting {
    fn escape(&self, value: &str) -> String {
        match self {
            Quoting::Posix => value.replace('\'', r"'\''"),
            Quoting::PowerShell => value.replace('\'', "''"),
        }
    }
}

/// Mapping from lowercase keys to parameter values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct ParameterSet(BTreeMap<String, Value>);

impl From<BTreeMap<String, Value>> for ParameterSet {
    fn from(map: BTreeMap<String, Value>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut set = ParameterSet::new();
        for (key, value) in iter {
            set.insert(key, value);
        }
        set
    }
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value; keys are lower-cased
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into().to_lowercase(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&key.to_lowercase())
    }

    /// Boolean flag lookup; absent or unparseable values are `false`
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Right-biased merge: on key collision the value from `overrides` wins.
    ///
    /// `defaults` is consumed and returned; `overrides` is left untouched.
    pub fn merge(mut defaults: ParameterSet, overrides: &ParameterSet) -> ParameterSet {
        for (key, value) in &overrides.0 {
            if defaults.0.contains_key(key) {
                debug!("Parameter `{}` overridden", key);
            }
            defaults.0.insert(key.clone(), value.clone());
        }
        defaults
    }

    /// Encode as `key='value'` tokens, escaping embedded quotes for `quoting`
    pub fn to_tokens(&self, quoting: Quoting) -> Vec<String> {
        self.0
            .iter()
            .map(|(key, value)| format!("{}='{}'", key, quoting.escape(&value.encode())))
            .collect()
    }

    /// Parse `key=value` command-line tokens.
    ///
    /// Keys are lower-cased, values are kept verbatim except for the
    /// well-known boolean flags.
    pub fn from_args<I, S>(args: I) -> Result<Self, ParameterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = ParameterSet::new();
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| ParameterError::InvalidToken(arg.to_string()))?;
            let key = key.to_lowercase();
            if key.is_empty() {
                return Err(ParameterError::InvalidToken(arg.to_string()));
            }

            if FLAG_KEYS.contains(&key.as_str()) {
                set.insert(key, value.eq_ignore_ascii_case("true"));
            } else {
                set.insert(key, value);
            }
        }
        Ok(set)
    }

    /// Decode into a typed step schema
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ParameterError> {
        let value = serde_json::to_value(&self.0)?;
        Ok(serde_json::from_value(value)?)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" | "" => Some(false),
        _ => None,
    }
}

/// Split a bracket-wrapped, comma-delimited string back into a list
pub fn decode_list(s: &str) -> Vec<String> {
    s.chars()
        .filter(|c| !matches!(c, '(' | ')' | '[' | ']'))
        .collect::<String>()
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Serde helpers for step schemas
///
/// Parameters arrive either already typed (from a step list) or as plain
/// strings (from a command line); these accept both.
pub mod de {
    use super::*;
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrText {
        List(Vec<String>),
        Text(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrText {
        Bool(bool),
        Text(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ItemsOrText<T> {
        Items(Vec<T>),
        Text(String),
    }

    /// A list, or a `[a,b,c]` string
    pub fn list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match ListOrText::deserialize(deserializer)? {
            ListOrText::List(items) => items,
            ListOrText::Text(s) => decode_list(&s),
        })
    }

    /// A boolean, or a `true`/`false` string
    pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        match BoolOrText::deserialize(deserializer)? {
            BoolOrText::Bool(b) => Ok(b),
            BoolOrText::Text(s) => {
                parse_bool(&s).ok_or_else(|| D::Error::custom(format!("not a boolean: {}", s)))
            }
        }
    }

    /// A list of records, or a JSON array string
    pub fn records<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        match ItemsOrText::<T>::deserialize(deserializer)? {
            ItemsOrText::Items(items) => Ok(items),
            ItemsOrText::Text(s) if s.trim().is_empty() => Ok(Vec::new()),
            ItemsOrText::Text(s) => serde_json::from_str(&s).map_err(D::Error::custom),
        }
    }
}
