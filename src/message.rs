//! MessagePack-RPC message types.
//!
//! Implements the three tuple shapes of the protocol:
//! ```text
//! ┌──────────────┬─────┬────────────────────────────────────────┐
//! │ Variant      │ Tag │ Shape                                  │
//! ├──────────────┼─────┼────────────────────────────────────────┤
//! │ Request      │  0  │ [0, msgid, method, params]             │
//! │ Response     │  1  │ [1, msgid, error, result]              │
//! │ Notification │  2  │ [2, method, params]                    │
//! └──────────────┴─────┴────────────────────────────────────────┘
//! ```
//!
//! `msgid` is an unsigned 32-bit integer; the `error`/`result`/`params`
//! slots hold arbitrary MessagePack values, untyped at this layer.

use rmpv::Value;

/// Wire tag for a request message.
pub const REQUEST_TYPE: u64 = 0;
/// Wire tag for a response message.
pub const RESPONSE_TYPE: u64 = 1;
/// Wire tag for a notification message.
pub const NOTIFICATION_TYPE: u64 = 2;

/// A decoded MessagePack-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request expecting a response correlated by `msgid`.
    Request {
        msgid: u32,
        method: String,
        params: Vec<Value>,
    },
    /// A response; exactly one of `error`/`result` is non-nil by convention.
    Response {
        msgid: u32,
        error: Value,
        result: Value,
    },
    /// A fire-and-forget message; no response is ever produced.
    Notification { method: String, params: Vec<Value> },
}

impl Message {
    /// Build a request message.
    pub fn request(msgid: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Message::Request {
            msgid,
            method: method.into(),
            params,
        }
    }

    /// Build a successful response (`error` slot nil).
    pub fn response(msgid: u32, result: Value) -> Self {
        Message::Response {
            msgid,
            error: Value::Nil,
            result,
        }
    }

    /// Build an error response (`result` slot nil).
    pub fn response_error(msgid: u32, error: Value) -> Self {
        Message::Response {
            msgid,
            error,
            result: Value::Nil,
        }
    }

    /// Build a notification message.
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    /// The msgid, for the variants that carry one.
    pub fn msgid(&self) -> Option<u32> {
        match self {
            Message::Request { msgid, .. } | Message::Response { msgid, .. } => Some(*msgid),
            Message::Notification { .. } => None,
        }
    }

    /// The method name, for the variants that carry one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method.as_str())
            }
            Message::Response { .. } => None,
        }
    }

    /// Convert into the wire-shaped array value.
    pub fn into_value(self) -> Value {
        match self {
            Message::Request {
                msgid,
                method,
                params,
            } => Value::Array(vec![
                Value::from(REQUEST_TYPE),
                Value::from(msgid),
                Value::from(method),
                Value::Array(params),
            ]),
            Message::Response {
                msgid,
                error,
                result,
            } => Value::Array(vec![
                Value::from(RESPONSE_TYPE),
                Value::from(msgid),
                error,
                result,
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(NOTIFICATION_TYPE),
                Value::from(method),
                Value::Array(params),
            ]),
        }
    }

    /// Classify a decoded value into a message.
    ///
    /// Hands the value back unchanged (`Err`) when it is not a structurally
    /// valid message, so the caller can still give it to the
    /// invalid-message hook.
    pub fn from_value(value: Value) -> std::result::Result<Self, Value> {
        if !is_message(&value) {
            return Err(value);
        }
        let items = match value {
            Value::Array(items) => items,
            other => return Err(other),
        };
        let mut items = items.into_iter();
        let tag = items.next().and_then(|v| v.as_u64());
        Ok(match tag {
            Some(REQUEST_TYPE) => Message::Request {
                msgid: take_msgid(&mut items),
                method: take_method(&mut items),
                params: take_params(&mut items),
            },
            Some(RESPONSE_TYPE) => Message::Response {
                msgid: take_msgid(&mut items),
                error: items.next().unwrap_or(Value::Nil),
                result: items.next().unwrap_or(Value::Nil),
            },
            _ => Message::Notification {
                method: take_method(&mut items),
                params: take_params(&mut items),
            },
        })
    }
}

/// Structural validator for decoded values.
///
/// Returns true iff the value is an array whose first element is 0, 1, or 2
/// and whose remaining elements match the variant's length and type tags.
/// Values failing the check are handed to the invalid-message hook by the
/// session and discarded.
pub fn is_message(value: &Value) -> bool {
    let Some(items) = value.as_array() else {
        return false;
    };
    let Some(tag) = items.first().and_then(|v| v.as_u64()) else {
        return false;
    };
    match tag {
        REQUEST_TYPE => {
            items.len() == 4
                && is_msgid(&items[1])
                && items[2].as_str().is_some()
                && items[3].is_array()
        }
        RESPONSE_TYPE => items.len() == 4 && is_msgid(&items[1]),
        NOTIFICATION_TYPE => {
            items.len() == 3 && items[1].as_str().is_some() && items[2].is_array()
        }
        _ => false,
    }
}

fn is_msgid(value: &Value) -> bool {
    value.as_u64().is_some_and(|id| id <= u64::from(u32::MAX))
}

// The take_* helpers run only after `is_message` admitted the array, so the
// fallbacks are never taken in practice.

fn take_msgid(items: &mut std::vec::IntoIter<Value>) -> u32 {
    items.next().and_then(|v| v.as_u64()).unwrap_or_default() as u32
}

fn take_method(items: &mut std::vec::IntoIter<Value>) -> String {
    match items.next() {
        Some(Value::String(s)) => s.into_str().unwrap_or_default(),
        _ => String::new(),
    }
}

fn take_params(items: &mut std::vec::IntoIter<Value>) -> Vec<Value> {
    match items.next() {
        Some(Value::Array(params)) => params,
        _ => Vec::new(),
    }
}
