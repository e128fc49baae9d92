// src/api/common.rs
// Request-id propagation and small shared extractors.

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

/// Keep a caller-provided request id only when it is sane; anything
/// oversized or empty is replaced with a fresh UUID.
pub fn sanitize_request_id(raw: Option<&str>) -> Option<String> {
    let s = raw?.trim();
    if s.is_empty() || s.len() > MAX_REQUEST_ID_LEN {
        return None;
    }
    Some(s.to_string())
}

/// Request-scoped correlation id, stored as an extension for handlers.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Middleware: derive the request id from the inbound header (or generate
/// one) and echo it on the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let inbound = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let request_id =
        sanitize_request_id(inbound).unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}

/// Parse a path/body UUID, tolerating surrounding whitespace.
pub fn parse_uuid(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_sanitization() {
        assert_eq!(sanitize_request_id(Some("abc-123")), Some("abc-123".to_string()));
        assert_eq!(sanitize_request_id(Some("  trimmed  ")), Some("trimmed".to_string()));
        assert_eq!(sanitize_request_id(Some("")), None);
        assert_eq!(sanitize_request_id(None), None);

        let long = "x".repeat(129);
        assert_eq!(sanitize_request_id(Some(&long)), None);
        let max = "x".repeat(128);
        assert!(sanitize_request_id(Some(&max)).is_some());
    }

    #[test]
    fn uuid_parsing_tolerates_whitespace() {
        assert!(parse_uuid(" 6a4f2b9e-8f2a-4c11-9e58-7f6b42a3c001 ").is_some());
        assert!(parse_uuid("nope").is_none());
    }
}
