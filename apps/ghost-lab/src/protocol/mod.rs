//! Envelopes exchanged over an open peer connection.
//!
//! The wire shape is a flat JSON object tagged by `type`:
//!
//! ```json
//! {"type":"term_out","data":"ls\r\n","v":1}
//! {"type":"typing","status":true}
//! ```
//!
//! Peers that predate the `v` field omit it and are treated as version 1.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PROTOCOL_VERSION: u64 = 1;

const VERSION_FIELD: &str = "v";
const KIND_FIELD: &str = "type";

/// Wire unit carried by a connection; opaque to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "term_out")]
    TerminalOut { data: String },
    #[serde(rename = "term_in")]
    TerminalIn { data: String },
    #[serde(rename = "chat")]
    Chat { text: String },
    #[serde(rename = "cmd")]
    Command {
        #[serde(rename = "cmd")]
        name: String,
    },
    #[serde(rename = "typing")]
    Typing {
        #[serde(rename = "status")]
        active: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    TerminalOut,
    TerminalIn,
    Chat,
    Command,
    Typing,
}

/// Local handler family an envelope is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Terminal,
    Presence,
    Trigger,
}

/// Registry of every kind this build understands, keyed by its wire tag.
const KIND_REGISTRY: [(&str, EnvelopeKind); 5] = [
    ("term_out", EnvelopeKind::TerminalOut),
    ("term_in", EnvelopeKind::TerminalIn),
    ("chat", EnvelopeKind::Chat),
    ("cmd", EnvelopeKind::Command),
    ("typing", EnvelopeKind::Typing),
];

impl EnvelopeKind {
    pub fn wire_name(self) -> &'static str {
        KIND_REGISTRY
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    pub fn from_wire(tag: &str) -> Option<Self> {
        KIND_REGISTRY
            .iter()
            .find(|(name, _)| *name == tag)
            .map(|(_, kind)| *kind)
    }

    pub fn channel(self) -> Channel {
        match self {
            EnvelopeKind::TerminalOut | EnvelopeKind::TerminalIn => Channel::Terminal,
            EnvelopeKind::Chat | EnvelopeKind::Typing => Channel::Presence,
            EnvelopeKind::Command => Channel::Trigger,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("envelope has no type tag")]
    MissingKind,
    #[error("unknown envelope kind {0:?}")]
    UnknownKind(String),
    #[error("unsupported envelope version {0} (supported up to {PROTOCOL_VERSION})")]
    UnsupportedVersion(u64),
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::TerminalOut { .. } => EnvelopeKind::TerminalOut,
            Envelope::TerminalIn { .. } => EnvelopeKind::TerminalIn,
            Envelope::Chat { .. } => EnvelopeKind::Chat,
            Envelope::Command { .. } => EnvelopeKind::Command,
            Envelope::Typing { .. } => EnvelopeKind::Typing,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut value =
            serde_json::to_value(self).map_err(|err| ProtocolError::Encode(err.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.insert(VERSION_FIELD.into(), Value::from(PROTOCOL_VERSION));
        }
        serde_json::to_vec(&value)
            .map(Bytes::from)
            .map_err(|err| ProtocolError::Encode(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        let Value::Object(map) = &value else {
            return Err(ProtocolError::Malformed("envelope is not an object".into()));
        };
        check_version(map)?;
        let tag = map
            .get(KIND_FIELD)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingKind)?;
        if EnvelopeKind::from_wire(tag).is_none() {
            return Err(ProtocolError::UnknownKind(tag.to_string()));
        }
        serde_json::from_value(value).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }
}

fn check_version(map: &Map<String, Value>) -> Result<(), ProtocolError> {
    let Some(raw) = map.get(VERSION_FIELD) else {
        return Ok(());
    };
    let version = raw
        .as_u64()
        .ok_or_else(|| ProtocolError::Malformed(format!("version field is not an integer: {raw}")))?;
    if version > PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_legacy_payloads_without_version() {
        let cases = [
            (json!({"type": "term_out", "data": "hi\r\n"}), Envelope::TerminalOut { data: "hi\r\n".into() }),
            (json!({"type": "term_in", "data": "ls"}), Envelope::TerminalIn { data: "ls".into() }),
            (json!({"type": "chat", "text": "yo"}), Envelope::Chat { text: "yo".into() }),
            (json!({"type": "cmd", "cmd": "trigger_hacker_fx"}), Envelope::Command { name: "trigger_hacker_fx".into() }),
            (json!({"type": "typing", "status": false}), Envelope::Typing { active: false }),
        ];
        for (wire, expected) in cases {
            let bytes = serde_json::to_vec(&wire).unwrap();
            assert_eq!(Envelope::decode(&bytes).unwrap(), expected);
        }
    }

    #[test]
    fn encode_stamps_version_and_keeps_field_names() {
        let bytes = Envelope::Typing { active: true }.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"type": "typing", "status": true, "v": 1}));

        let bytes = Envelope::Command { name: "flash".into() }.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["cmd"], "flash");
    }

    #[test]
    fn unknown_kind_is_reported_not_panicked() {
        let err = Envelope::decode(br#"{"type":"screen_share","data":"x"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind("screen_share".into()));
    }

    #[test]
    fn future_version_is_rejected() {
        let err = Envelope::decode(br#"{"type":"chat","text":"x","v":7}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedVersion(7));
    }

    #[test]
    fn malformed_payloads_are_classified() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(b"[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            Envelope::decode(br#"{"data":"x"}"#).unwrap_err(),
            ProtocolError::MissingKind
        );
        // known tag, wrong payload shape
        assert!(matches!(
            Envelope::decode(br#"{"type":"typing","status":"yes"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn kinds_map_to_channels() {
        assert_eq!(EnvelopeKind::TerminalIn.channel(), Channel::Terminal);
        assert_eq!(EnvelopeKind::Typing.channel(), Channel::Presence);
        assert_eq!(EnvelopeKind::Command.channel(), Channel::Trigger);
        assert_eq!(EnvelopeKind::from_wire("cmd"), Some(EnvelopeKind::Command));
        assert_eq!(EnvelopeKind::Chat.wire_name(), "chat");
    }
}
