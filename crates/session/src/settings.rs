use pgctx_auth::Claims;
use serde_json::{Map, Number, Value};

use crate::connection::Query;

const CLAIM_PREFIX: &str = "jwt.claims.";

/// A value headed for `set_config`. Composite claim values stay JSON and are
/// serialized by the connection when bound.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Text(String),
    Number(Number),
    Json(Value),
}

impl SettingValue {
    pub fn from_claim(value: &Value) -> Self {
        match value {
            Value::String(s) => SettingValue::Text(s.clone()),
            Value::Number(n) => SettingValue::Number(n.clone()),
            other => SettingValue::Json(other.clone()),
        }
    }

    /// Text form bound as a statement parameter. JSON `null` binds as SQL NULL.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            SettingValue::Text(s) => Some(s.clone()),
            SettingValue::Number(n) => Some(n.to_string()),
            SettingValue::Json(Value::Null) => None,
            SettingValue::Json(value) => Some(value.to_string()),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Number(value.into())
    }
}

/// A statically configured setting value, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum PgSettingValue {
    String(String),
    Number(Number),
    Null,
    Undefined,
    Boolean(bool),
    /// Objects and arrays.
    Object(Value),
    /// An opaque host token with no SQL representation.
    Symbol(String),
}

impl PgSettingValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => PgSettingValue::Null,
            Value::Bool(b) => PgSettingValue::Boolean(*b),
            Value::Number(n) => PgSettingValue::Number(n.clone()),
            Value::String(s) => PgSettingValue::String(s.clone()),
            Value::Array(_) | Value::Object(_) => PgSettingValue::Object(value.clone()),
        }
    }
}

impl From<&str> for PgSettingValue {
    fn from(value: &str) -> Self {
        PgSettingValue::String(value.to_string())
    }
}

impl From<String> for PgSettingValue {
    fn from(value: String) -> Self {
        PgSettingValue::String(value)
    }
}

impl From<i64> for PgSettingValue {
    fn from(value: i64) -> Self {
        PgSettingValue::Number(value.into())
    }
}

impl From<bool> for PgSettingValue {
    fn from(value: bool) -> Self {
        PgSettingValue::Boolean(value)
    }
}

/// Static settings applied to every request, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PgSettings {
    entries: Vec<(String, PgSettingValue)>,
}

impl PgSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`; re-inserting an existing key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PgSettingValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn from_json_object(map: &Map<String, Value>) -> Self {
        map.iter()
            .map(|(k, v)| (k.clone(), PgSettingValue::from_json(v)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PgSettingValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, PgSettingValue)> for PgSettings {
    fn from_iter<I: IntoIterator<Item = (K, PgSettingValue)>>(iter: I) -> Self {
        let mut settings = PgSettings::new();
        for (key, value) in iter {
            settings.insert(key, value);
        }
        settings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Object,
    Symbol,
    Boolean,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Object => "object",
            ValueKind::Symbol => "symbol",
            ValueKind::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSettingError {
    pub key: String,
    pub kind: ValueKind,
}

impl std::fmt::Display for PgSettingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Error converting pgSetting: {} needs to be of type string or number.",
            self.kind.as_str()
        )
    }
}

impl std::error::Error for PgSettingError {}

/// Merges role, static settings and claims into the ordered list applied by
/// the settings call: role first, then static settings, then one
/// `jwt.claims.<name>` entry per claim.
pub fn compile_settings(
    static_settings: Option<&PgSettings>,
    claims: &Claims,
    role: Option<&Value>,
    default_role: Option<&str>,
) -> Result<Vec<(String, SettingValue)>, PgSettingError> {
    let mut out = Vec::with_capacity(
        1 + static_settings.map(PgSettings::len).unwrap_or(0) + claims.len(),
    );

    if let Some(role) = role {
        out.push(("role".to_string(), SettingValue::from_claim(role)));
    } else if let Some(default_role) = default_role {
        out.push(("role".to_string(), SettingValue::from(default_role)));
    }

    if let Some(static_settings) = static_settings {
        for (key, value) in static_settings.iter() {
            let value = match value {
                PgSettingValue::Null | PgSettingValue::Undefined => continue,
                PgSettingValue::String(s) => SettingValue::Text(s.clone()),
                PgSettingValue::Number(n) if is_zero(n) => SettingValue::Text("0".to_string()),
                PgSettingValue::Number(n) => SettingValue::Number(n.clone()),
                PgSettingValue::Boolean(_) => return Err(setting_error(key, ValueKind::Boolean)),
                PgSettingValue::Object(_) => return Err(setting_error(key, ValueKind::Object)),
                PgSettingValue::Symbol(_) => return Err(setting_error(key, ValueKind::Symbol)),
            };
            out.push((key.to_string(), value));
        }
    }

    for (name, value) in claims {
        out.push((
            format!("{}{}", CLAIM_PREFIX, name),
            SettingValue::from_claim(value),
        ));
    }

    Ok(out)
}

/// Builds the single batched `set_config` call, or `None` when there is nothing to apply.
pub fn settings_query(settings: &[(String, SettingValue)]) -> Option<Query> {
    if settings.is_empty() {
        return None;
    }

    let calls = (0..settings.len())
        .map(|idx| format!("set_config(${},${},true)", idx * 2 + 1, idx * 2 + 2))
        .collect::<Vec<_>>()
        .join(", ");

    let mut values = Vec::with_capacity(settings.len() * 2);
    for (key, value) in settings {
        values.push(SettingValue::Text(key.clone()));
        values.push(value.clone());
    }

    Some(Query::with_values(format!("select {}", calls), values))
}

fn setting_error(key: &str, kind: ValueKind) -> PgSettingError {
    PgSettingError {
        key: key.to_string(),
        kind,
    }
}

fn is_zero(n: &Number) -> bool {
    n.as_f64() == Some(0.0)
}
