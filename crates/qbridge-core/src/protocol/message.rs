//! Message envelopes exchanged with the client.
//!
//! Every message is a JSON object with a `command` field. Outbound and
//! inbound command sets are disjoint.

use crate::introspect::TypeInfo;
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Backend-to-client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Outbound {
    #[serde(rename = "VERSION")]
    Version { version: u32 },

    #[serde(rename = "CREATABLE_TYPES")]
    CreatableTypes { types: Vec<TypeInfo> },

    #[serde(rename = "ROOT")]
    Root {
        identifier: String,
        #[serde(rename = "type")]
        type_info: TypeInfo,
        data: Map<String, Value>,
    },

    /// Full property snapshot of one object.
    #[serde(rename = "OBJECT_RESET")]
    ObjectReset {
        identifier: String,
        data: Map<String, Value>,
    },

    /// Signal emission; `method` carries the signal name.
    #[serde(rename = "EMIT")]
    Emit {
        identifier: String,
        method: String,
        parameters: Vec<Value>,
    },
}

impl Outbound {
    pub fn command(&self) -> &'static str {
        match self {
            Outbound::Version { .. } => "VERSION",
            Outbound::CreatableTypes { .. } => "CREATABLE_TYPES",
            Outbound::Root { .. } => "ROOT",
            Outbound::ObjectReset { .. } => "OBJECT_RESET",
            Outbound::Emit { .. } => "EMIT",
        }
    }
}

/// Client-to-backend message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Inbound {
    #[serde(rename = "OBJECT_REF")]
    ObjectRef { identifier: String },

    #[serde(rename = "OBJECT_DEREF")]
    ObjectDeref { identifier: String },

    #[serde(rename = "OBJECT_QUERY")]
    ObjectQuery { identifier: String },

    #[serde(rename = "OBJECT_CREATE")]
    ObjectCreate {
        identifier: String,
        #[serde(rename = "typeName")]
        type_name: String,
    },

    #[serde(rename = "INVOKE")]
    Invoke {
        identifier: String,
        method: String,
        parameters: Vec<Value>,
    },
}

#[derive(Deserialize)]
struct Envelope {
    command: String,
}

impl Inbound {
    pub const COMMANDS: [&'static str; 5] = [
        "OBJECT_REF",
        "OBJECT_DEREF",
        "OBJECT_QUERY",
        "OBJECT_CREATE",
        "INVOKE",
    ];

    /// Decode one inbound payload.
    ///
    /// Unknown commands and malformed envelopes are distinguished so the
    /// failure names what was wrong.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(payload)?;
        if !Self::COMMANDS.contains(&envelope.command.as_str()) {
            return Err(BridgeError::UnknownCommand {
                command: envelope.command,
            });
        }

        serde_json::from_slice(payload).map_err(|e| BridgeError::MalformedMessage {
            command: envelope.command,
            message: e.to_string(),
        })
    }

    pub fn identifier(&self) -> &str {
        match self {
            Inbound::ObjectRef { identifier }
            | Inbound::ObjectDeref { identifier }
            | Inbound::ObjectQuery { identifier }
            | Inbound::ObjectCreate { identifier, .. }
            | Inbound::Invoke { identifier, .. } => identifier,
        }
    }
}
