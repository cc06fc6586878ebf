//! Outbound request construction for the completions route.

use axum::http::HeaderMap;
use axum::http::header::{ACCEPT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use bytes::Bytes;
use serde_json::{Map, Value, json};

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("Invalid JSON body: {0}")]
    Malformed(String),
}

/// Force streaming with inline usage on a chat completions body.
///
/// The body must be a JSON object; an empty body is treated as `{}`. Numbers
/// and key order pass through untouched. `stream` and `stream_options` are
/// replaced wholesale.
pub fn rewrite_body(body: &[u8]) -> Result<Bytes, RewriteError> {
    let mut request: Map<String, Value> = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(RewriteError::Malformed(format!(
                    "expected a JSON object, got {}",
                    kind(&other)
                )));
            }
            Err(e) => return Err(RewriteError::Malformed(e.to_string())),
        }
    };

    request.insert("stream".to_string(), Value::Bool(true));
    request.insert(
        "stream_options".to_string(),
        json!({ "include_usage": true }),
    );

    serde_json::to_vec(&request)
        .map(Bytes::from)
        .map_err(|e| RewriteError::Malformed(e.to_string()))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Headers to send upstream: everything the caller sent except framing and
/// routing headers that belong to the inbound hop.
///
/// `accept-encoding` is dropped as well: the relay must see an identity-coded
/// body to find usage records.
pub fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if name == CONTENT_LENGTH
            || name == HOST
            || name == TRANSFER_ENCODING
            || name == ACCEPT_ENCODING
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};

    fn rewritten(body: &str) -> Value {
        let bytes = rewrite_body(body.as_bytes()).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_rewrite_forces_streaming_usage() {
        let json = rewritten(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#);
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_rewrite_overwrites_client_values() {
        let json = rewritten(
            r#"{"model":"m","stream":false,"stream_options":{"include_usage":false,"extra":1}}"#,
        );
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"], json!({ "include_usage": true }));
    }

    #[test]
    fn test_rewrite_empty_body() {
        let json = rewritten("");
        assert_eq!(
            json,
            json!({ "stream": true, "stream_options": { "include_usage": true } })
        );
        assert_eq!(rewritten("  \n"), json);
    }

    #[test]
    fn test_rewrite_preserves_numbers_and_key_order() {
        let body = r#"{"seed":12345678901234567890,"temperature":0.70,"model":"m"}"#;
        let bytes = rewrite_body(body.as_bytes()).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.contains(r#""seed":12345678901234567890"#));
        assert!(text.contains(r#""temperature":0.70"#));
        let seed = text.find("seed").unwrap();
        let temperature = text.find("temperature").unwrap();
        let model = text.find("model").unwrap();
        let stream = text.find("\"stream\"").unwrap();
        assert!(seed < temperature && temperature < model && model < stream);
    }

    #[test]
    fn test_rewrite_rejects_invalid_json() {
        assert!(matches!(
            rewrite_body(b"{\"model\":"),
            Err(RewriteError::Malformed(_))
        ));
        assert!(matches!(
            rewrite_body(b"not json"),
            Err(RewriteError::Malformed(_))
        ));
    }

    #[test]
    fn test_rewrite_rejects_non_objects() {
        for body in ["[1,2]", "\"text\"", "42", "null", "true"] {
            let err = rewrite_body(body.as_bytes()).unwrap_err();
            assert!(
                err.to_string().contains("expected a JSON object"),
                "{body}: {err}"
            );
        }
    }

    #[test]
    fn test_forward_headers_drops_hop_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-test"));
        inbound.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        inbound.insert(HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        inbound.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));

        let headers = forward_headers(&inbound);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert!(headers.get(HOST).is_none());
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert!(headers.get(ACCEPT_ENCODING).is_none());
    }

    #[test]
    fn test_forward_headers_keeps_repeated_values() {
        let mut inbound = HeaderMap::new();
        inbound.append("x-tag", HeaderValue::from_static("a"));
        inbound.append("x-tag", HeaderValue::from_static("b"));

        let headers = forward_headers(&inbound);
        let values: Vec<&str> = headers
            .get_all("x-tag")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["a", "b"]);
    }
}
