//! Wire messages exchanged between the bridge and the worker.
//!
//! Foreground → background traffic is a batch of [`Message`]s: an id, a
//! message type name and that type's fields, flattened into one record.
//! The worker decodes each message into a typed [`Request`] with
//! [`Request::decode`]; an unknown type name is a protocol error.
//!
//! Background → foreground traffic is a batch of [`Reply`]s. Every message
//! not marked `oneWay` gets exactly one `acknowledge` followed by exactly one
//! `resolve` or `reject` carrying the same id.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::Error;
use crate::query::Query;
use crate::store::{DisconnectOp, EventType, SimulatedOp};

/// Per-sender monotonically increasing message id.
pub type MessageId = u64;

/// Identifier of a callback registered on the bridge.
pub type CallbackId = u64;

// ── Message ──────────────────────────────────────────────────────────

/// Untyped envelope: `{id, msg, ...fields, oneWay?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub msg: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub one_way: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    /// Build the envelope for a typed request.
    pub fn new(id: MessageId, request: &Request, one_way: bool) -> Self {
        let mut fields = match serde_json::to_value(request) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let msg = match fields.remove("msg") {
            Some(Value::String(msg)) => msg,
            _ => request.kind().to_string(),
        };
        Self {
            id,
            msg,
            one_way,
            fields,
        }
    }

    /// Message type, if known to this side of the protocol.
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_str(&self.msg).ok()
    }
}

/// Every message type the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum MessageKind {
    Init,
    Call,
    AuthWithCustomToken,
    Unauth,
    OnAuth,
    OffAuth,
    Set,
    Update,
    On,
    Off,
    Once,
    Transaction,
    OnDisconnect,
    Simulate,
    BounceConnection,
    UpdateLocalStorage,
    Ping,
    Destroy,
}

// ── Request ──────────────────────────────────────────────────────────

/// Options accepted by the `on` handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenOptions {
    /// Forward only changed subpaths after the first snapshot.
    #[serde(default)]
    pub sync: bool,
}

/// Typed view of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Init {
        #[serde(default)]
        storage: BTreeMap<String, String>,
    },
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    AuthWithCustomToken {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
    Unauth,
    OnAuth {
        callback_id: CallbackId,
    },
    OffAuth {
        callback_id: CallbackId,
    },
    Set {
        url: String,
        value: Value,
    },
    Update {
        url: String,
        value: Map<String, Value>,
    },
    On {
        listener_key: String,
        query: Query,
        event_type: EventType,
        callback_id: CallbackId,
        #[serde(default)]
        options: ListenOptions,
    },
    Off {
        listener_key: String,
        query: Query,
        event_type: EventType,
        callback_id: CallbackId,
    },
    Once {
        query: Query,
        event_type: EventType,
    },
    Transaction {
        url: String,
        old_hash: String,
        new_value: Value,
    },
    OnDisconnect {
        url: String,
        op: DisconnectOp,
    },
    Simulate {
        token: String,
        op: SimulatedOp,
    },
    BounceConnection,
    UpdateLocalStorage {
        items: BTreeMap<String, Option<String>>,
    },
    Ping,
    Destroy,
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Init { .. } => MessageKind::Init,
            Self::Call { .. } => MessageKind::Call,
            Self::AuthWithCustomToken { .. } => MessageKind::AuthWithCustomToken,
            Self::Unauth => MessageKind::Unauth,
            Self::OnAuth { .. } => MessageKind::OnAuth,
            Self::OffAuth { .. } => MessageKind::OffAuth,
            Self::Set { .. } => MessageKind::Set,
            Self::Update { .. } => MessageKind::Update,
            Self::On { .. } => MessageKind::On,
            Self::Off { .. } => MessageKind::Off,
            Self::Once { .. } => MessageKind::Once,
            Self::Transaction { .. } => MessageKind::Transaction,
            Self::OnDisconnect { .. } => MessageKind::OnDisconnect,
            Self::Simulate { .. } => MessageKind::Simulate,
            Self::BounceConnection => MessageKind::BounceConnection,
            Self::UpdateLocalStorage { .. } => MessageKind::UpdateLocalStorage,
            Self::Ping => MessageKind::Ping,
            Self::Destroy => MessageKind::Destroy,
        }
    }

    /// Decode a message into a typed request.
    ///
    /// Fails with [`Error::UnknownMessage`] for unknown type names and with
    /// [`Error::Malformed`] when a known type carries bad fields.
    pub fn decode(message: &Message) -> Result<Self, Error> {
        if message.kind().is_none() {
            return Err(Error::UnknownMessage(message.msg.clone()));
        }
        let mut fields = message.fields.clone();
        fields.insert("msg".into(), Value::String(message.msg.clone()));
        serde_json::from_value(Value::Object(fields)).map_err(|e| Error::Malformed {
            msg: message.msg.clone(),
            reason: e.to_string(),
        })
    }
}

// ── Reply ────────────────────────────────────────────────────────────

/// Serialized error: its name plus every diagnostic property it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WireError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            extra: Map::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        let name = match err {
            Error::PermissionDenied { .. } | Error::Store { .. } | Error::ListenerCancelled { .. } => {
                "RemoteError"
            }
            Error::UnknownMessage(_) | Error::Malformed { .. } => "ProtocolError",
            Error::Unsupported(_) | Error::InvalidPath(_) | Error::ChannelClosed => "Error",
        };
        let mut wire = Self::new(name, err.to_string()).with_code(err.code());
        match err {
            Error::PermissionDenied { operation, path } => {
                wire = wire
                    .with_extra("operation", Value::String(operation.clone()))
                    .with_extra("path", Value::String(path.clone()));
            }
            Error::Store { extra, .. } => {
                for (k, v) in extra {
                    wire.extra.insert(k.clone(), v.clone());
                }
            }
            Error::ListenerCancelled { path, .. } => {
                wire = wire.with_extra("path", Value::String(path.clone()));
            }
            _ => {}
        }
        wire
    }
}

/// Snapshot envelope delivered to listener callbacks.
///
/// Carries either the value or, when the value could not be read,
/// whether it exists and why reading it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub path: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_serial: Option<u64>,
}

impl Snapshot {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            exists: None,
            value_error: None,
            write_serial: None,
        }
    }

    pub fn unreadable(path: impl Into<String>, exists: bool, error: WireError) -> Self {
        Self {
            path: path.into(),
            value: Value::Null,
            exists: Some(exists),
            value_error: Some(error),
            write_serial: None,
        }
    }

    pub fn with_write_serial(mut self, serial: u64) -> Self {
        self.write_serial = Some(serial);
        self
    }

    /// Whether the snapshot holds a value.
    pub fn exists(&self) -> bool {
        self.exists.unwrap_or(!self.value.is_null())
    }
}

/// Messages flowing from the worker back to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Reply {
    /// The message reached the worker.
    Acknowledge { id: MessageId },
    /// The handler succeeded.
    Resolve {
        id: MessageId,
        #[serde(default)]
        result: Value,
    },
    /// The handler failed.
    Reject { id: MessageId, error: WireError },
    /// Invoke a callback registered on the bridge.
    Callback { id: CallbackId, args: Vec<Value> },
    /// Local storage writes made on the worker side.
    UpdateLocalStorage {
        items: BTreeMap<String, Option<String>>,
    },
}

impl Reply {
    /// Id of the message this reply settles, if it is a terminal reply.
    pub fn settles(&self) -> Option<MessageId> {
        match self {
            Self::Resolve { id, .. } | Self::Reject { id, .. } => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn message_flattens_request_fields() {
        let request = Request::Set {
            url: "/a/b".into(),
            value: json!(1),
        };
        let message = Message::new(7, &request, false);
        assert_eq!(message.msg, "set");
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"id": 7, "msg": "set", "url": "/a/b", "value": 1})
        );
    }

    #[test]
    fn one_way_flag_is_serialized_only_when_set() {
        let message = Message::new(1, &Request::Ping, true);
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"id": 1, "msg": "ping", "oneWay": true})
        );
    }

    #[test]
    fn decode_round_trips_typed_requests() {
        let request = Request::Transaction {
            url: "/counter".into(),
            old_hash: "abc".into(),
            new_value: json!(2),
        };
        let message = Message::new(3, &request, false);
        assert_eq!(message.fields["oldHash"], json!("abc"));
        assert_eq!(Request::decode(&message).unwrap(), request);
    }

    #[test]
    fn decode_rejects_unknown_message_types() {
        let message = Message {
            id: 1,
            msg: "teleport".into(),
            one_way: false,
            fields: Map::new(),
        };
        assert_eq!(
            Request::decode(&message),
            Err(Error::UnknownMessage("teleport".into()))
        );
    }

    #[test]
    fn decode_reports_malformed_fields() {
        let message = Message {
            id: 1,
            msg: "set".into(),
            one_way: false,
            fields: Map::new(),
        };
        assert!(matches!(Request::decode(&message), Err(Error::Malformed { .. })));
    }

    #[test]
    fn message_kind_names_are_camel_case() {
        assert_eq!(MessageKind::AuthWithCustomToken.to_string(), "authWithCustomToken");
        assert_eq!(MessageKind::from_str("bounceConnection"), Ok(MessageKind::BounceConnection));
        assert_eq!(Request::OffAuth { callback_id: 3 }.kind().to_string(), "offAuth");
    }

    #[test]
    fn wire_error_keeps_diagnostic_extras() {
        let err = Error::PermissionDenied {
            operation: "set".into(),
            path: "/secret".into(),
        };
        let wire = WireError::from(&err);
        insta::assert_json_snapshot!(wire, @r#"
        {
          "name": "RemoteError",
          "message": "Permission denied: set at /secret",
          "code": "permission_denied",
          "operation": "set",
          "path": "/secret"
        }
        "#);
    }

    #[test]
    fn reply_serialization_is_tagged() {
        let reply = Reply::Callback {
            id: 4,
            args: vec![json!({"path": "/a", "value": 1})],
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"msg": "callback", "id": 4, "args": [{"path": "/a", "value": 1}]})
        );
        assert_eq!(Reply::Acknowledge { id: 9 }.settles(), None);
    }
}
