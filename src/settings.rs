//! String-keyed settings bag consumed from the host application.
//!
//! Mirrors the host's untyped config store: getters return the type's zero
//! value when a key is absent, and defaults never override a value the user
//! already set.

use std::collections::HashMap;

use crate::feeder_bindings;

/// Settings keys understood by the stream.
pub const SETTING_URL: &str = "zixi_url";
pub const SETTING_PASSWORD: &str = "zixi_password";
pub const SETTING_LATENCY_ID: &str = "zixi_latency_id";
pub const SETTING_ENCRYPTION_ID: &str = "zixi_encryption_id";
pub const SETTING_ENCRYPTION_KEY: &str = "zixi_encryption_key";
pub const SETTING_ENCODER_FEEDBACK: &str = "zixi_encoder_feedback";
pub const SETTING_BONDING: &str = "zixi_bonding";
pub const SETTING_RTMP_FORWARD: &str = "zixi_fwd";
pub const SETTING_SHOW_ENCRYPTION_KEY: &str = "zixi_show_encryption_key";
pub const SETTING_VERSION: &str = "zixi_version";

/// RTMP endpoint keys, reused from the host's stream settings when
/// forwarding is enabled.
pub const SETTING_RTMP_SERVER: &str = "server";
pub const SETTING_RTMP_USERNAME: &str = "username";
pub const SETTING_RTMP_PASSWORD: &str = "password";
pub const SETTING_RTMP_KEY: &str = "key";

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// Untyped key/value bag with host-config semantics.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, Value>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), Value::Bool(value));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), Value::Int(value));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.to_string(), Value::Str(value.to_string()));
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(v)) => *v,
            _ => false,
        }
    }

    pub fn get_int(&self, key: &str) -> i64 {
        match self.values.get(key) {
            Some(Value::Int(v)) => *v,
            _ => 0,
        }
    }

    pub fn get_string(&self, key: &str) -> &str {
        match self.values.get(key) {
            Some(Value::Str(v)) => v.as_str(),
            _ => "",
        }
    }

    fn set_default(&mut self, key: &str, value: Value) {
        self.values.entry(key.to_string()).or_insert(value);
    }

    /// Apply creation-time defaults without clobbering user values.
    ///
    /// The advertised version string comes from the feeder when it is
    /// loaded; otherwise the placeholder the host displays verbatim.
    pub fn apply_defaults(&mut self) {
        self.set_default(SETTING_ENCRYPTION_ID, Value::Int(3));
        self.set_default(SETTING_LATENCY_ID, Value::Int(6));
        self.set_default(SETTING_SHOW_ENCRYPTION_KEY, Value::Bool(false));

        let version = match feeder_bindings::feeder_version() {
            Some((_, minor, minor_minor, build)) => {
                format!("{}.{}.{}", minor, minor_minor, build)
            }
            None => "Failed to load version".to_string(),
        };
        self.set_default(SETTING_VERSION, Value::Str(version));
    }
}
