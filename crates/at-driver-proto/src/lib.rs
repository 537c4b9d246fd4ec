//! Shared protocol definitions for harness ↔ driver communication.
//! Keeping this in a dedicated crate lets clients and test suites speak the
//! protocol without pulling in the server runtime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

/// The only WebSocket sub-protocol the driver accepts.
pub const SUB_PROTOCOL: &str = "v1.aria-at.bocoup.com";

/// Default TCP port for the command server.
pub const DEFAULT_PORT: u16 = 4382;

/// Methods understood by the command server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    SessionNew,
    InteractionPressKeys,
}

impl Method {
    pub const ALL: [Method; 2] = [Method::SessionNew, Method::InteractionPressKeys];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::SessionNew => "session.new",
            Method::InteractionPressKeys => "interaction.pressKeys",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unrecognized command name: \"{0}\".")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|method| method.as_str() == name)
            .ok_or_else(|| UnknownMethod(name.to_string()))
    }
}

/// Closed set of error classes reported in the `error` field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "unable to parse message")]
    Parse,
    #[serde(rename = "malformed message")]
    Malformed,
    #[serde(rename = "unrecognized message type")]
    UnrecognizedType,
    #[serde(rename = "missing id")]
    MissingId,
    #[serde(rename = "unknown command")]
    UnknownCommand,
    #[serde(rename = "unknown error")]
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "unable to parse message",
            ErrorKind::Malformed => "malformed message",
            ErrorKind::UnrecognizedType => "unrecognized message type",
            ErrorKind::MissingId => "missing id",
            ErrorKind::UnknownCommand => "unknown command",
            ErrorKind::UnknownError => "unknown error",
        }
    }
}

/// A command sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: Number,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

impl CommandRequest {
    pub fn new(id: impl Into<Number>, method: Method, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.as_str().to_string(),
            params,
        }
    }
}

/// Reply to a single command. `id` is `None` only when the message failed
/// before it could be correlated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success {
        id: Number,
        result: Value,
    },
    Failure {
        id: Option<Number>,
        error: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Response {
    pub fn success(id: Number, result: Value) -> Self {
        Response::Success { id, result }
    }

    pub fn failure(id: Option<Number>, error: ErrorKind, message: impl Into<String>) -> Self {
        Response::Failure {
            id,
            error,
            message: Some(message.into()),
        }
    }

    pub fn id(&self) -> Option<&Number> {
        match self {
            Response::Success { id, .. } => Some(id),
            Response::Failure { id, .. } => id.as_ref(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }
}

/// Unsolicited notification pushed to every sessioned client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ServerEvent {
    #[serde(rename = "interaction.capturedOutput")]
    CapturedOutput { data: String },
}

/// Anything the server may push down a connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(ServerEvent),
    Response(Response),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub at_name: String,
    pub at_version: String,
    pub platform_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    pub session_id: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressKeysParams {
    pub keys: Vec<String>,
}
