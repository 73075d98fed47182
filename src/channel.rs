//! Channel descriptors.
//!
//! A channel is one configured provider endpoint owned by one organization,
//! identified by a UUID and a short type tag. Its configuration is an opaque
//! key→value map; callers read it through typed accessors that fall back to
//! a supplied default on missing or wrong-typed values.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ConfigError;

/// Short channel type tag, 2-3 uppercase alphanumerics (`TG`, `WA`, `MCK`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(String);

impl ChannelType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ChannelType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.to_ascii_uppercase();
        if (2..=3).contains(&tag.len()) && tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(ChannelType(tag))
        } else {
            Err(ConfigError::InvalidChannelType(s.to_string()))
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capabilities a channel is provisioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Send,
    Receive,
    Call,
    Answer,
}

/// Database row id of a channel.
pub type ChannelId = i64;

/// Organization reference carried on channels and messages.
pub type OrgId = i64;

/// One configured provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub uuid: Uuid,
    pub id: ChannelId,
    pub channel_type: ChannelType,
    pub name: String,
    /// Phone number or account identifier on the provider side.
    pub address: String,
    /// ISO-2 country the channel operates in.
    pub country: String,
    /// URN schemes this channel serves, in preference order.
    pub schemes: Vec<String>,
    pub roles: Vec<ChannelRole>,
    /// Untyped per-channel configuration (secrets, endpoints, tunables).
    pub config: Map<String, Value>,
    pub org_id: OrgId,
    /// Untyped per-org configuration.
    pub org_config: Map<String, Value>,
}

impl Channel {
    /// Minimal constructor used by backends and tests.
    pub fn new(uuid: Uuid, channel_type: ChannelType, name: &str, address: &str, country: &str) -> Self {
        Channel {
            uuid,
            id: 0,
            channel_type,
            name: name.to_string(),
            address: address.to_string(),
            country: country.to_string(),
            schemes: vec!["tel".to_string()],
            roles: vec![ChannelRole::Send, ChannelRole::Receive],
            config: Map::new(),
            org_id: 0,
            org_config: Map::new(),
        }
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_schemes(mut self, schemes: Vec<String>) -> Self {
        self.schemes = schemes;
        self
    }

    pub fn has_role(&self, role: ChannelRole) -> bool {
        self.roles.contains(&role)
    }

    /// String config value for `key`, or `default` when missing or not a string.
    pub fn config_string(&self, key: &str, default: &str) -> String {
        match self.config.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }

    /// Integer config value for `key`, or `default` when missing or not an integer.
    pub fn config_int(&self, key: &str, default: i64) -> i64 {
        match self.config.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            _ => default,
        }
    }

    /// Boolean config value for `key`, or `default` when missing or not a bool.
    pub fn config_bool(&self, key: &str, default: bool) -> bool {
        match self.config.get(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    /// String value from the owning org's config map.
    pub fn org_config_string(&self, key: &str, default: &str) -> String {
        match self.org_config.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn channel() -> Channel {
        let config = json!({
            "auth_token": "sesame",
            "max_length": 160,
            "send_via_api": true,
            "fraction": 1.5,
        });
        let Value::Object(config) = config else { unreachable!() };
        Channel::new(
            Uuid::new_v4(),
            "MCK".parse().expect("type"),
            "Test",
            "+12065551212",
            "US",
        )
        .with_config(config)
    }

    #[test]
    fn channel_type_parsing() {
        assert_eq!("tg".parse::<ChannelType>().expect("tag").as_str(), "TG");
        assert!("TOOLONG".parse::<ChannelType>().is_err());
        assert!("T".parse::<ChannelType>().is_err());
        assert!("T!".parse::<ChannelType>().is_err());
    }

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let ch = channel();
        assert_eq!(ch.config_string("auth_token", ""), "sesame");
        assert_eq!(ch.config_string("missing", "dflt"), "dflt");
        // wrong type falls back too
        assert_eq!(ch.config_string("max_length", "dflt"), "dflt");

        assert_eq!(ch.config_int("max_length", 0), 160);
        assert_eq!(ch.config_int("auth_token", 7), 7);
        assert_eq!(ch.config_int("fraction", 7), 7);

        assert!(ch.config_bool("send_via_api", false));
        assert!(!ch.config_bool("auth_token", false));
    }
}
