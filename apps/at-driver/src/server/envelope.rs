//! Validation of inbound command frames.
//!
//! Every check short-circuits into a ready-to-send failure response, so the
//! connection loop only ever sees well-formed requests.

use at_driver_proto::{ErrorKind, Method, Response};
use serde_json::{Map, Number, Value};

/// A command that passed every envelope check.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: Number,
    pub method: Method,
    pub params: Value,
}

pub fn parse_request(raw: &str) -> Result<Envelope, Response> {
    let value: Value = serde_json::from_str(raw).map_err(|_| {
        Response::failure(
            None,
            ErrorKind::Parse,
            format!("Unable to parse message: \"{raw}\"."),
        )
    })?;

    let Value::Object(mut message) = value else {
        return Err(Response::failure(
            None,
            ErrorKind::Malformed,
            format!("Malformed message: \"{raw}\"."),
        ));
    };

    let id = numeric_id(&message);
    let method = match message.remove("method") {
        Some(Value::String(method)) => method,
        _ => {
            return Err(Response::failure(
                id,
                ErrorKind::UnrecognizedType,
                format!("Unrecognized message type: \"{raw}\"."),
            ))
        }
    };

    let Some(id) = id else {
        return Err(Response::failure(
            None,
            ErrorKind::MissingId,
            format!("Command missing required \"id\": \"{raw}\"."),
        ));
    };

    let method: Method = method
        .parse()
        .map_err(|err: at_driver_proto::UnknownMethod| {
            Response::failure(Some(id.clone()), ErrorKind::UnknownCommand, err.to_string())
        })?;

    let params = match message.remove("params") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(params) => params,
    };

    Ok(Envelope { id, method, params })
}

fn numeric_id(message: &Map<String, Value>) -> Option<Number> {
    match message.get("id") {
        Some(Value::Number(id)) => Some(id.clone()),
        _ => None,
    }
}
