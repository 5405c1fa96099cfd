//! Wire message model.
//!
//! Three message shapes travel over a protoo connection, all JSON objects
//! told apart by which discriminator key is present:
//!
//! ```text
//! {"request":true,"id":12,"method":"join","data":{..}}
//! {"response":true,"id":12,"ok":true,"data":{..}}
//! {"response":true,"id":12,"ok":false,"errorCode":403,"errorReason":"nope"}
//! {"notification":true,"method":"chat","data":{..}}
//! ```

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::ParseError;

/// Upper bound (exclusive) for randomly generated request ids.
pub const MAX_RANDOM_REQUEST_ID: u32 = 10_000_000;

/// Draw a random request id in `[0, MAX_RANDOM_REQUEST_ID)`.
pub fn generate_request_id() -> u32 {
    rand::rng().random_range(0..MAX_RANDOM_REQUEST_ID)
}

/// A decoded protoo message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Expects exactly one [`Response`] with the same id.
    Request(Request),
    /// Answer to a previously sent [`Request`].
    Response(Response),
    /// Fire-and-forget.
    Notification(Notification),
}

/// A request awaiting a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id echoed by the response.
    pub id: u32,
    /// Application method name.
    pub method: String,
    /// Application payload, `Null` when absent.
    pub data: Value,
}

/// Outcome of a request as sent by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `ok: true`.
    Success {
        /// Id of the answered request.
        id: u32,
        /// Result payload, `Null` when absent.
        data: Value,
    },
    /// `ok: false`.
    Error {
        /// Id of the answered request.
        id: u32,
        /// Application error code.
        error_code: i32,
        /// Human readable reason.
        error_reason: String,
    },
}

/// A one-way message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Application method name.
    pub method: String,
    /// Application payload, `Null` when absent.
    pub data: Value,
}

impl Request {
    /// Build a request with a random id.
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self::with_id(generate_request_id(), method, data)
    }

    /// Build a request with a caller-chosen id.
    pub fn with_id(id: u32, method: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            method: method.into(),
            data,
        }
    }

    /// Deserialize the payload into `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

impl Response {
    /// Success response answering `request`.
    pub fn success(request: &Request, data: Value) -> Self {
        Self::Success {
            id: request.id,
            data,
        }
    }

    /// Error response answering `request`.
    pub fn error(request: &Request, code: i32, reason: impl Into<String>) -> Self {
        Self::Error {
            id: request.id,
            error_code: code,
            error_reason: reason.into(),
        }
    }

    /// Id of the request this response answers.
    pub fn id(&self) -> u32 {
        match self {
            Self::Success { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    /// Whether this is an `ok: true` response.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl Notification {
    /// Build a notification.
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }

    /// Deserialize the payload into `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

impl Message {
    /// Parse one wire message.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        parse(raw)
    }

    /// Serialize to wire text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse(raw)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(r) => write!(f, "request [method:{}, id:{}]", r.method, r.id),
            Self::Response(r) => write!(f, "response [id:{}, ok:{}]", r.id(), r.is_ok()),
            Self::Notification(n) => write!(f, "notification [method:{}]", n.method),
        }
    }
}

/// Keys that tell the three message shapes apart. Exactly one must be present.
const DISCRIMINATORS: [&str; 3] = ["request", "response", "notification"];

/// Parse one wire message.
pub fn parse(raw: &str) -> Result<Message, ParseError> {
    let root: Value =
        serde_json::from_str(raw).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let object = match root {
        Value::Object(object) => object,
        // Arrays are valid roots but never carry a discriminator.
        Value::Array(_) => return Err(ParseError::MissingDiscriminator),
        other => {
            return Err(ParseError::InvalidJson(format!(
                "root must be an object, got {}",
                json_type(&other)
            )));
        }
    };

    let present: Vec<&str> = DISCRIMINATORS
        .into_iter()
        .filter(|key| object.contains_key(*key))
        .collect();
    match present.as_slice() {
        [] => Err(ParseError::MissingDiscriminator),
        ["request"] => parse_request(&object),
        ["response"] => parse_response(&object),
        ["notification"] => parse_notification(&object),
        _ => Err(ParseError::MultipleDiscriminators),
    }
}

fn parse_request(object: &Map<String, Value>) -> Result<Message, ParseError> {
    Ok(Message::Request(Request {
        id: required_id(object)?,
        method: required_method(object)?,
        data: data_of(object),
    }))
}

fn parse_response(object: &Map<String, Value>) -> Result<Message, ParseError> {
    let id = required_id(object)?;
    if object.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(Message::Response(Response::Success {
            id,
            data: data_of(object),
        }));
    }
    let code = object
        .get("errorCode")
        .ok_or(ParseError::MissingField("errorCode"))?;
    let reason = object
        .get("errorReason")
        .ok_or(ParseError::MissingField("errorReason"))?;
    Ok(Message::Response(Response::Error {
        id,
        error_code: code
            .as_i64()
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(-1),
        error_reason: reason.as_str().unwrap_or_default().to_owned(),
    }))
}

fn parse_notification(object: &Map<String, Value>) -> Result<Message, ParseError> {
    Ok(Message::Notification(Notification {
        method: required_method(object)?,
        data: data_of(object),
    }))
}

fn required_id(object: &Map<String, Value>) -> Result<u32, ParseError> {
    object
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or(ParseError::MissingField("id"))
}

fn required_method(object: &Map<String, Value>) -> Result<String, ParseError> {
    object
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(ParseError::MissingField("method"))
}

fn data_of(object: &Map<String, Value>) -> Value {
    object.get("data").cloned().unwrap_or(Value::Null)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    request: bool,
    id: u32,
    method: &'a str,
    data: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse<'a> {
    response: bool,
    id: u32,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_reason: Option<&'a str>,
}

#[derive(Serialize)]
struct WireNotification<'a> {
    notification: bool,
    method: &'a str,
    data: &'a Value,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(r) => WireRequest {
                request: true,
                id: r.id,
                method: &r.method,
                data: &r.data,
            }
            .serialize(serializer),
            Self::Response(Response::Success { id, data }) => WireResponse {
                response: true,
                id: *id,
                ok: true,
                data: Some(data),
                error_code: None,
                error_reason: None,
            }
            .serialize(serializer),
            Self::Response(Response::Error {
                id,
                error_code,
                error_reason,
            }) => WireResponse {
                response: true,
                id: *id,
                ok: false,
                data: None,
                error_code: Some(*error_code),
                error_reason: Some(error_reason),
            }
            .serialize(serializer),
            Self::Notification(n) => WireNotification {
                notification: true,
                method: &n.method,
                data: &n.data,
            }
            .serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn parses_request() {
        let msg = parse(r#"{"request":true,"id":7,"method":"join","data":{"a":1}}"#).unwrap();
        assert_eq!(
            msg,
            Message::Request(Request::with_id(7, "join", json!({"a": 1})))
        );
    }

    #[test]
    fn request_data_defaults_to_null() {
        let msg = parse(r#"{"request":true,"id":1,"method":"m"}"#).unwrap();
        assert_matches!(msg, Message::Request(Request { data: Value::Null, .. }));
    }

    #[test]
    fn discriminator_is_checked_by_presence() {
        let msg = parse(r#"{"request":false,"id":1,"method":"m"}"#).unwrap();
        assert_eq!(msg.kind(), "request");
    }

    #[test]
    fn request_missing_method() {
        assert_eq!(
            parse(r#"{"request":true,"id":1}"#),
            Err(ParseError::MissingField("method"))
        );
        assert_eq!(
            parse(r#"{"request":true,"id":1,"method":5}"#),
            Err(ParseError::MissingField("method"))
        );
    }

    #[test]
    fn request_missing_or_invalid_id() {
        assert_eq!(
            parse(r#"{"request":true,"method":"m"}"#),
            Err(ParseError::MissingField("id"))
        );
        assert_eq!(
            parse(r#"{"request":true,"id":"1","method":"m"}"#),
            Err(ParseError::MissingField("id"))
        );
        assert_eq!(
            parse(r#"{"request":true,"id":-3,"method":"m"}"#),
            Err(ParseError::MissingField("id"))
        );
        assert_eq!(
            parse(r#"{"request":true,"id":4294967296,"method":"m"}"#),
            Err(ParseError::MissingField("id"))
        );
    }

    #[test]
    fn parses_success_response() {
        let msg = parse(r#"{"response":true,"id":9,"ok":true,"data":[1,2]}"#).unwrap();
        assert_eq!(
            msg,
            Message::Response(Response::Success {
                id: 9,
                data: json!([1, 2])
            })
        );
    }

    #[test]
    fn parses_error_response() {
        let msg =
            parse(r#"{"response":true,"id":9,"ok":false,"errorCode":404,"errorReason":"nope"}"#)
                .unwrap();
        assert_eq!(
            msg,
            Message::Response(Response::Error {
                id: 9,
                error_code: 404,
                error_reason: "nope".into()
            })
        );
    }

    #[test]
    fn response_without_ok_is_an_error_response() {
        let msg = parse(r#"{"response":true,"id":9,"errorCode":1,"errorReason":"x"}"#).unwrap();
        assert_matches!(msg, Message::Response(Response::Error { error_code: 1, .. }));
    }

    #[test]
    fn error_response_requires_code_and_reason() {
        assert_eq!(
            parse(r#"{"response":true,"id":9,"ok":false,"errorReason":"x"}"#),
            Err(ParseError::MissingField("errorCode"))
        );
        assert_eq!(
            parse(r#"{"response":true,"id":9,"ok":false,"errorCode":1}"#),
            Err(ParseError::MissingField("errorReason"))
        );
    }

    #[test]
    fn malformed_error_fields_fall_back() {
        let msg = parse(r#"{"response":true,"id":2,"ok":false,"errorCode":"E","errorReason":5}"#)
            .unwrap();
        assert_eq!(
            msg,
            Message::Response(Response::Error {
                id: 2,
                error_code: -1,
                error_reason: String::new()
            })
        );
    }

    #[test]
    fn response_missing_id() {
        assert_eq!(
            parse(r#"{"response":true,"ok":true}"#),
            Err(ParseError::MissingField("id"))
        );
    }

    #[test]
    fn parses_notification() {
        let msg = parse(r#"{"notification":true,"method":"chat","data":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Notification(Notification::new("chat", json!("hi")))
        );
        assert_eq!(
            parse(r#"{"notification":true}"#),
            Err(ParseError::MissingField("method"))
        );
    }

    #[test]
    fn rejects_non_json_and_scalars() {
        assert_matches!(parse("not json"), Err(ParseError::InvalidJson(_)));
        assert_matches!(parse("42"), Err(ParseError::InvalidJson(_)));
        assert_matches!(parse(""), Err(ParseError::InvalidJson(_)));
    }

    #[test]
    fn rejects_missing_discriminator() {
        assert_eq!(parse(r#"{"id":1}"#), Err(ParseError::MissingDiscriminator));
        assert_eq!(parse("[1,2]"), Err(ParseError::MissingDiscriminator));
    }

    #[test]
    fn rejects_multiple_discriminators() {
        assert_eq!(
            parse(r#"{"request":true,"response":true,"id":1,"method":"m","ok":true}"#),
            Err(ParseError::MultipleDiscriminators)
        );
        assert_eq!(
            parse(r#"{"response":true,"notification":true,"id":1,"method":"m","ok":true}"#),
            Err(ParseError::MultipleDiscriminators)
        );
        assert_eq!(
            parse(r#"{"request":1,"response":1,"notification":1,"id":1,"method":"m"}"#),
            Err(ParseError::MultipleDiscriminators)
        );
    }

    #[test]
    fn typed_payload_views() {
        #[derive(Debug, PartialEq, serde::Deserialize)]
        struct Join {
            room: String,
            muted: bool,
        }

        let request = Request::with_id(1, "join", json!({"room": "r1", "muted": false}));
        assert_eq!(
            request.data_as::<Join>().unwrap(),
            Join {
                room: "r1".into(),
                muted: false
            }
        );
        assert!(Request::with_id(1, "join", Value::Null).data_as::<Join>().is_err());

        let notification = Notification::new("volume", json!(42));
        assert_eq!(notification.data_as::<u8>().unwrap(), 42);
        assert!(notification.data_as::<String>().is_err());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = parse(r#"{"notification":true,"method":"m","extra":{"x":1}}"#).unwrap();
        assert_eq!(msg, Message::Notification(Notification::new("m", Value::Null)));
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let request = Request::with_id(3, "join", Value::Null);
        let text = Message::from(request.clone()).to_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"request": true, "id": 3, "method": "join", "data": null})
        );

        let text = Message::from(Response::error(&request, 500, "boom"))
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"response": true, "id": 3, "ok": false, "errorCode": 500, "errorReason": "boom"})
        );

        let text = Message::from(Response::success(&request, json!({"v": 1})))
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"response": true, "id": 3, "ok": true, "data": {"v": 1}})
        );
    }

    #[test]
    fn random_ids_stay_in_range() {
        for _ in 0..1000 {
            assert!(generate_request_id() < MAX_RANDOM_REQUEST_ID);
            assert!(Request::new("m", Value::Null).id < MAX_RANDOM_REQUEST_ID);
        }
    }

    #[test]
    fn display_names_the_method() {
        let msg = Message::from(Request::with_id(4, "join", Value::Null));
        assert_eq!(msg.to_string(), "request [method:join, id:4]");
    }

    fn arb_data() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".{0,16}".prop_map(Value::from),
            prop::collection::vec(any::<i32>(), 0..4).prop_map(|v| json!(v)),
            ("[a-z]{1,6}", any::<u16>()).prop_map(|(k, v)| {
                let mut object = Map::new();
                let _ = object.insert(k, Value::from(v));
                Value::Object(object)
            }),
        ]
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u32>(), ".{0,12}", arb_data())
                .prop_map(|(id, m, d)| Message::Request(Request::with_id(id, m, d))),
            (any::<u32>(), arb_data())
                .prop_map(|(id, data)| Message::Response(Response::Success { id, data })),
            (any::<u32>(), any::<i32>(), ".{0,12}").prop_map(|(id, code, reason)| {
                Message::Response(Response::Error {
                    id,
                    error_code: code,
                    error_reason: reason,
                })
            }),
            (".{0,12}", arb_data())
                .prop_map(|(m, d)| Message::Notification(Notification::new(m, d))),
        ]
    }

    proptest! {
        #[test]
        fn serialized_messages_parse_back(msg in arb_message()) {
            let text = msg.to_json().unwrap();
            prop_assert_eq!(parse(&text).unwrap(), msg);
        }

        #[test]
        fn parse_never_panics(raw in ".{0,64}") {
            let _ = parse(&raw);
        }

        #[test]
        fn parse_never_panics_on_object_like_input(
            key in prop_oneof![Just("request"), Just("response"), Just("notification"), Just("other")],
            id in any::<i64>(),
            method in ".{0,8}",
        ) {
            let raw = format!(r#"{{"{key}":true,"id":{id},"method":{}}}"#, json!(method));
            let _ = parse(&raw);
        }
    }
}
