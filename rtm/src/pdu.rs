//! Protocol data units exchanged with the RTM service and the reply types
//! handed to application callbacks.

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::error::{ErrorKind, Result};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// No status code was present in the peer's close frame.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Abnormal local failure (handshake, TLS or socket I/O).
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Policy violation, used when the service sends an unclassified error.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Error code carried by every outcome synthesized on connection loss.
pub const DISCONNECT_ERROR: &str = "disconnect";
const DISCONNECT_REASON: &str = "Connection is closed";

macro_rules! actions {
    ( $( $(#[$m:meta])* $name:ident => $wire:expr, )* ) => {
        /// The `action` of a PDU.
        ///
        /// Unknown actions are kept verbatim in [`Action::Other`].
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum Action {
            $( $(#[$m])* $name, )*
            Other(String),
        }

        impl Action {
            pub fn as_str(&self) -> &str {
                match self {
                    $( Action::$name => $wire, )*
                    Action::Other(s) => s.as_str(),
                }
            }
        }

        impl From<&str> for Action {
            fn from(s: &str) -> Self {
                match s {
                    $( $wire => Action::$name, )*
                    other => Action::Other(other.to_string()),
                }
            }
        }
    };
}

actions! {
    Publish => "rtm/publish",
    PublishOk => "rtm/publish/ok",
    PublishError => "rtm/publish/error",
    Read => "rtm/read",
    ReadOk => "rtm/read/ok",
    ReadError => "rtm/read/error",
    Write => "rtm/write",
    WriteOk => "rtm/write/ok",
    WriteError => "rtm/write/error",
    Delete => "rtm/delete",
    DeleteOk => "rtm/delete/ok",
    DeleteError => "rtm/delete/error",
    Subscribe => "rtm/subscribe",
    SubscribeOk => "rtm/subscribe/ok",
    SubscribeError => "rtm/subscribe/error",
    Unsubscribe => "rtm/unsubscribe",
    UnsubscribeOk => "rtm/unsubscribe/ok",
    UnsubscribeError => "rtm/unsubscribe/error",
    SubscriptionData => "rtm/subscription/data",
    SubscriptionInfo => "rtm/subscription/info",
    SubscriptionError => "rtm/subscription/error",
    Handshake => "auth/handshake",
    HandshakeOk => "auth/handshake/ok",
    HandshakeError => "auth/handshake/error",
    Authenticate => "auth/authenticate",
    AuthenticateOk => "auth/authenticate/ok",
    AuthenticateError => "auth/authenticate/error",
    /// Unsolicited, connection level error.
    SystemError => "/error",
}

impl Action {
    /// Positive replies end in `/ok`.
    pub fn is_ok(&self) -> bool {
        self.as_str().ends_with("/ok")
    }

    /// Push PDUs that belong to a subscription.
    pub fn is_subscription(&self) -> bool {
        self.as_str().starts_with("rtm/subscription")
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        match Action::from(s.as_str()) {
            Action::Other(_) => Action::Other(s),
            known => known,
        }
    }
}

impl From<Action> for String {
    fn from(a: Action) -> Self {
        match a {
            Action::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One envelope on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pdu {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub body: Value,
}

impl Pdu {
    pub fn new(action: Action, body: Value) -> Self {
        Pdu {
            action,
            id: None,
            body,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(crate::map_context!())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            let kind = ErrorKind::SerdeJsonDe(String::from_utf8_lossy(data).to_string());
            crate::context!(e, kind)
        })
    }
}

impl fmt::Display for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Body of every outcome synthesized when the connection is lost.
pub(crate) fn disconnect_body() -> Value {
    json!({
        "error": DISCONNECT_ERROR,
        "reason": DISCONNECT_REASON,
    })
}

/// Why the connection was closed or could not be established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        CloseEvent {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

impl fmt::Display for CloseEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -- '{}'", self.code, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Ok,
    Error,
    Disconnect,
}

/// The outcome of a correlated request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    kind: ReplyKind,
    action: Option<Action>,
    data: Value,
}

impl Reply {
    pub(crate) fn disconnect() -> Self {
        Reply {
            kind: ReplyKind::Disconnect,
            action: None,
            data: disconnect_body(),
        }
    }

    /// Synthesizes an error reply that never came from the wire.
    pub(crate) fn local_error(error: &str, reason: &str) -> Self {
        Reply {
            kind: ReplyKind::Error,
            action: None,
            data: json!({ "error": error, "reason": reason }),
        }
    }

    pub fn kind(&self) -> ReplyKind {
        self.kind
    }

    /// The reply action, `None` for locally synthesized replies.
    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.kind == ReplyKind::Ok
    }

    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    /// The PDU body.
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    pub fn error(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    pub fn reason(&self) -> Option<&str> {
        self.data.get("reason").and_then(Value::as_str)
    }

    pub fn position(&self) -> Option<&str> {
        self.data.get("position").and_then(Value::as_str)
    }

    /// The `message` field of a read reply.
    pub fn message(&self) -> Option<&Value> {
        self.data.get("message")
    }
}

impl From<Pdu> for Reply {
    fn from(pdu: Pdu) -> Self {
        let kind = if pdu.action.is_ok() {
            ReplyKind::Ok
        } else {
            ReplyKind::Error
        };
        Reply {
            kind,
            action: Some(pdu.action),
            data: pdu.body,
        }
    }
}

/// Inserts `key` into an object body, turning a non-object body into one.
pub(crate) fn insert_field(body: &mut Value, key: &str, value: Value) {
    if !body.is_object() {
        *body = Value::Object(Map::new());
    }
    if let Value::Object(map) = body {
        map.insert(key.to_string(), value);
    }
}
