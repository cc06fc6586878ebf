//! Caller identification.
//!
//! The bearer token is an opaque caller id: it is never validated here, only
//! used as the ledger key. The upstream authenticates it.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use crate::error::AppError;

/// Extract the Bearer token from the Authorization header.
///
/// Returns `None` when the header is missing, not valid ASCII, uses another
/// scheme, or carries an empty token. Such requests are not metered.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Like [`bearer_token`], but a missing token is an error.
pub fn require_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing or invalid Bearer token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_bearer_token_valid() {
        assert_eq!(
            bearer_token(&headers("Bearer sk-abc123")).as_deref(),
            Some("sk-abc123")
        );
        assert_eq!(
            bearer_token(&headers("Bearer   padded  ")).as_deref(),
            Some("padded")
        );
    }

    #[test]
    fn test_bearer_token_missing_header() {
        assert!(bearer_token(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_bearer_token_wrong_scheme() {
        assert!(bearer_token(&headers("Basic dXNlcjpwYXNz")).is_none());
        assert!(bearer_token(&headers("bearer sk-abc")).is_none());
        assert!(bearer_token(&headers("Bearer")).is_none());
    }

    #[test]
    fn test_bearer_token_empty() {
        assert!(bearer_token(&headers("Bearer ")).is_none());
        assert!(bearer_token(&headers("Bearer    ")).is_none());
    }

    #[test]
    fn test_require_bearer_token() {
        assert_eq!(require_bearer_token(&headers("Bearer k")).unwrap(), "k");
        let err = require_bearer_token(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
