//! Wire envelopes exchanged through the store.
//!
//! All binary payloads travel as standard base64 strings inside JSON objects.
//!
//! | Channel                                | Envelope                          |
//! |----------------------------------------|-----------------------------------|
//! | `sessions/{id}/ssh/{input,output}`     | [`ShellData`]                     |
//! | `sessions/{id}/http/input`             | [`HttpRequest`]                   |
//! | `sessions/{id}/http/output`            | [`HttpResponse`]                  |
//! | `sessions/{id}/http/streams/{reqId}_stream` | [`StreamFrame`]              |

use std::collections::BTreeMap;

use axum::http;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::CodecError;

/// Raw bytes carried as a base64 string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64
            .decode(s.as_bytes())
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

/// One header value, or several for repeated headers (`set-cookie`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

impl HeaderValue {
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            HeaderValue::One(v) => std::slice::from_ref(v),
            HeaderValue::Many(vs) => vs,
        };
        slice.iter().map(String::as_str)
    }
}

/// Header map with lowercase names.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Headers that describe a single hop and must not be relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Convert an `http` header map, dropping hop-by-hop headers.
pub fn headers_from_http(map: &http::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in map {
        let name = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match out.remove(&name) {
            None => {
                out.insert(name, HeaderValue::One(value));
            }
            Some(HeaderValue::One(first)) => {
                out.insert(name, HeaderValue::Many(vec![first, value]));
            }
            Some(HeaderValue::Many(mut all)) => {
                all.push(value);
                out.insert(name, HeaderValue::Many(all));
            }
        }
    }
    out
}

/// Convert back into an `http` header map. Invalid names or values and
/// hop-by-hop headers are skipped.
pub fn headers_to_http(headers: &Headers) -> http::HeaderMap {
    let mut map = http::HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let Ok(name) = http::HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for v in value.values() {
            if let Ok(v) = http::HeaderValue::from_str(v) {
                map.append(name.clone(), v);
            }
        }
    }
    map
}

/// A chunk of terminal bytes on `ssh/input` or `ssh/output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellData {
    pub data: Payload,
}

/// Caller details recorded once into the session `info/client`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// A proxied request on `http/input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub req_id: String,
    pub port: u16,
    pub method: String,
    /// Path and query forwarded to the local server.
    pub uri: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

/// Marker on a response message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Headers only; the body follows on the stream path.
    Start,
    /// Forwarding failed on the server side; `body` describes the error.
    Error,
}

/// A response message on `http/output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub req_id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResponseKind>,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub body: Payload,
}

impl HttpResponse {
    pub fn is_start(&self) -> bool {
        self.kind == Some(ResponseKind::Start)
    }

    /// Response describing a failure to reach the local server.
    pub fn upstream_error(req_id: &str, status: u16, message: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert(
            "content-type".to_string(),
            HeaderValue::One("text/plain; charset=utf-8".to_string()),
        );
        Self {
            req_id: req_id.to_string(),
            kind: Some(ResponseKind::Error),
            status,
            headers,
            body: Payload(format!("Error: {message}").into_bytes()),
        }
    }
}

/// One message on `streams/{reqId}_stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    Chunk {
        body: Payload,
    },
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Name of the stream channel for a request.
pub fn stream_key(req_id: &str) -> String {
    format!("{req_id}_stream")
}

/// Serialize an envelope into a store value.
pub fn encode<T: Serialize>(msg: &T) -> Result<Value, CodecError> {
    Ok(serde_json::to_value(msg)?)
}

/// Decode a store value into an envelope.
pub fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, CodecError> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shell_data_is_base64_on_the_wire() {
        let msg = ShellData {
            data: Payload(vec![0, 159, 146, 150, b'\n']),
        };
        let value = encode(&msg).unwrap();
        assert_eq!(value, json!({"data": "AJ+Slgo="}));
        assert_eq!(decode::<ShellData>(value).unwrap(), msg);
    }

    #[test]
    fn payload_survives_any_bytes() {
        let every_byte: Vec<u8> = (0..=255).collect();
        // Not valid UTF-8 anywhere: lone continuation and overlong bytes.
        let large: Vec<u8> = (0..256 * 1024u32)
            .map(|i| [0xC0, 0x80, 0xFF, 0x00, 0xFE][(i % 5) as usize] ^ (i >> 8) as u8)
            .collect();
        assert!(std::str::from_utf8(&large).is_err());

        for bytes in [Vec::new(), every_byte, large] {
            let msg = ShellData { data: Payload(bytes.clone()) };
            let value = encode(&msg).unwrap();
            assert!(value["data"].is_string());
            assert_eq!(decode::<ShellData>(value).unwrap().data.into_bytes(), bytes);
        }
        let empty = ShellData { data: Payload::default() };
        assert_eq!(encode(&empty).unwrap(), json!({"data": ""}));
    }

    #[test]
    fn invalid_base64_is_a_decode_error() {
        assert!(decode::<ShellData>(json!({"data": "***"})).is_err());
    }

    #[test]
    fn request_uses_camel_case_and_numeric_port() {
        let value = json!({
            "reqId": "abc",
            "port": 8080,
            "method": "GET",
            "uri": "/x?y=1",
            "headers": {"accept": "*/*", "cookie": ["a=1", "b=2"]},
            "body": "",
            "clientInfo": {"ip": "10.0.0.1", "userAgent": "curl/8"}
        });
        let req: HttpRequest = decode(value).unwrap();
        assert_eq!(req.port, 8080);
        assert_eq!(
            req.headers["cookie"],
            HeaderValue::Many(vec!["a=1".into(), "b=2".into()])
        );
        assert_eq!(req.client_info.unwrap().user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn start_and_plain_responses_are_distinguished() {
        let start: HttpResponse =
            decode(json!({"reqId": "r", "type": "start", "status": 200, "headers": {}})).unwrap();
        assert!(start.is_start());
        assert!(start.body.is_empty());

        let plain: HttpResponse =
            decode(json!({"reqId": "r", "status": 404, "headers": {}, "body": "bm8="})).unwrap();
        assert!(!plain.is_start());
        assert_eq!(plain.body.as_bytes(), b"no");
    }

    #[test]
    fn stream_frames_are_tagged() {
        assert_eq!(
            encode(&StreamFrame::Chunk { body: Payload(b"hi".to_vec()) }).unwrap(),
            json!({"type": "chunk", "body": "aGk="})
        );
        assert_eq!(
            encode(&StreamFrame::End { error: None }).unwrap(),
            json!({"type": "end"})
        );
        let end: StreamFrame = decode(json!({"type": "end", "error": "reset"})).unwrap();
        assert_eq!(end, StreamFrame::End { error: Some("reset".into()) });
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut map = http::HeaderMap::new();
        map.insert("connection", http::HeaderValue::from_static("close"));
        map.insert("x-a", http::HeaderValue::from_static("1"));
        map.append("set-cookie", http::HeaderValue::from_static("a=1"));
        map.append("set-cookie", http::HeaderValue::from_static("b=2"));
        let headers = headers_from_http(&map);
        assert!(!headers.contains_key("connection"));
        assert_eq!(headers["x-a"], HeaderValue::One("1".into()));

        let back = headers_to_http(&headers);
        assert_eq!(back.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn upstream_error_body_is_prefixed() {
        let resp = HttpResponse::upstream_error("r1", 502, "connection refused");
        assert_eq!(resp.body.as_bytes(), b"Error: connection refused");
        assert_eq!(resp.kind, Some(ResponseKind::Error));
    }
}
