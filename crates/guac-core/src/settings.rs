//! Connection settings and their resolution.
//!
//! Final connection parameters are built by deep-merging, lowest to highest
//! precedence:
//!
//! 1. the per-type default table configured on the gateway,
//! 2. the `settings` object carried inside the decrypted token,
//! 3. query-string parameters whose names appear in the per-type allow-list.
//!
//! The connection type itself only ever comes from the token.

use crate::query::QueryParams;
use crate::token::TokenPayload;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Protocols the daemon can be asked to select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Rdp,
    Vnc,
    Ssh,
    Telnet,
    Kubernetes,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 5] = [
        ConnectionType::Rdp,
        ConnectionType::Vnc,
        ConnectionType::Ssh,
        ConnectionType::Telnet,
        ConnectionType::Kubernetes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Rdp => "rdp",
            ConnectionType::Vnc => "vnc",
            ConnectionType::Ssh => "ssh",
            ConnectionType::Telnet => "telnet",
            ConnectionType::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown connection type: {s}"))
    }
}

/// Display size sent to the daemon in the `size` handshake instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            dpi: 96,
        }
    }
}

impl Dimensions {
    /// Read `width`, `height` and `dpi` from merged parameters.
    ///
    /// Values may be numbers or numeric strings (query overrides are always
    /// strings). Missing or unparseable values fall back per field.
    pub fn from_parameters(parameters: &Map<String, Value>) -> Self {
        let fallback = Self::default();
        let read = |key: &str, default: u32| {
            parameters.get(key).and_then(value_as_u32).unwrap_or(default)
        };
        Self {
            width: read("width", fallback.width),
            height: read("height", fallback.height),
            dpi: read("dpi", fallback.dpi),
        }
    }
}

fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Fully resolved parameters for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Protocol to select. `None` when the token did not name one.
    pub connection_type: Option<ConnectionType>,
    pub dimensions: Dimensions,
    /// Merged protocol parameters, looked up by name during the handshake.
    pub parameters: Map<String, Value>,
}

impl ConnectionSettings {
    pub fn new(connection_type: Option<ConnectionType>, parameters: Map<String, Value>) -> Self {
        Self {
            connection_type,
            dimensions: Dimensions::from_parameters(&parameters),
            parameters,
        }
    }

    /// A parameter rendered as handshake text.
    ///
    /// `None` (sent as the empty field) when missing or falsy: null, `false`,
    /// zero and the empty string all leave the attribute unset for guacd.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.parameters.get(name).and_then(render_value)
    }
}

/// Render a JSON value as a single protocol field.
fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(true) => Some("true".to_string()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|item| render_value(item).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Per-type default parameter tables.
pub type DefaultSettings = HashMap<ConnectionType, Map<String, Value>>;

/// Per-type names a client may supply unencrypted in the query string.
pub type AllowList = HashMap<ConnectionType, Vec<String>>;

/// Built-in default parameters.
pub fn builtin_defaults() -> DefaultSettings {
    let table = |port: Value| match json!({
        "args": "connect",
        "port": port,
        "width": 1024,
        "height": 768,
        "dpi": 96,
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    HashMap::from([
        (ConnectionType::Rdp, table(json!("3389"))),
        (ConnectionType::Vnc, table(json!("5900"))),
        (ConnectionType::Ssh, table(json!(22))),
        (ConnectionType::Telnet, table(json!(23))),
    ])
}

/// Built-in allow-lists of unencrypted overrides.
pub fn builtin_allow_list() -> AllowList {
    let display: &[&str] = &["width", "height", "dpi"];
    let terminal: &[&str] = &["color-scheme", "font-name", "font-size", "width", "height", "dpi"];
    let owned = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();

    HashMap::from([
        (ConnectionType::Rdp, owned(display)),
        (ConnectionType::Vnc, owned(display)),
        (ConnectionType::Ssh, owned(terminal)),
        (ConnectionType::Telnet, owned(terminal)),
        (ConnectionType::Kubernetes, owned(display)),
    ])
}

/// Deep structural merge of `source` into `target`.
///
/// Nested objects merge key-wise; every other value (arrays included)
/// replaces what was there.
pub fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, incoming) in source {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Merge defaults, token settings and allow-listed query overrides.
///
/// The `type` key is never taken from the query string, even if an
/// allow-list names it.
pub fn resolve_parameters(
    connection_type: Option<ConnectionType>,
    defaults: &DefaultSettings,
    token_settings: &Map<String, Value>,
    query: &QueryParams,
    allow_list: &AllowList,
) -> Map<String, Value> {
    let mut merged = Map::new();

    if let Some(table) = connection_type.and_then(|t| defaults.get(&t)) {
        deep_merge(&mut merged, table);
    }
    deep_merge(&mut merged, token_settings);

    let allowed = connection_type
        .and_then(|t| allow_list.get(&t))
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let overrides: Map<String, Value> = query
        .iter()
        .filter(|(key, _)| *key != "type" && allowed.iter().any(|a| a.as_str() == *key))
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect();
    deep_merge(&mut merged, &overrides);

    merged
}

/// Resolves a decrypted token plus query string into [`ConnectionSettings`].
#[derive(Debug, Clone)]
pub struct SettingsResolver {
    defaults: DefaultSettings,
    allow_list: AllowList,
}

impl Default for SettingsResolver {
    fn default() -> Self {
        Self::new(builtin_defaults(), builtin_allow_list())
    }
}

impl SettingsResolver {
    pub fn new(defaults: DefaultSettings, allow_list: AllowList) -> Self {
        Self {
            defaults,
            allow_list,
        }
    }

    pub fn resolve(&self, token: &TokenPayload, query: &QueryParams) -> ConnectionSettings {
        let connection_type = token.connection.connection_type;
        let parameters = resolve_parameters(
            connection_type,
            &self.defaults,
            &token.connection.settings,
            query,
            &self.allow_list,
        );
        ConnectionSettings::new(connection_type, parameters)
    }
}
