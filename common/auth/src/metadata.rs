//! Header and metadata plumbing shared by the interceptors.

use http::HeaderMap;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// Header carrying the bearer credential.
pub const AUTH_HEADER: &str = "authorization";
/// Header carrying the caller's organization hint, cased as the gateway
/// sends it.
pub const ORG_HEADER: &str = "openai-organization";
/// Header carrying the caller's project hint.
pub const PROJECT_HEADER: &str = "openai-project";

/// Copies the auth/org/project entries from an incoming request's metadata
/// onto an outgoing one, so fan-out calls keep the caller's identity.
pub fn carry_metadata(incoming: &MetadataMap, outgoing: &mut MetadataMap) {
    for header in [AUTH_HEADER, ORG_HEADER, PROJECT_HEADER] {
        if let Some(value) = incoming.get(header) {
            outgoing.insert(header, value.clone());
        }
    }
}

/// Extracts the bearer token from the `authorization` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<String, Status> {
    let value = headers
        .get(http::header::AUTHORIZATION)
        .ok_or_else(|| Status::unauthenticated("missing authorization"))?;
    let raw = value
        .to_str()
        .map_err(|_| Status::unauthenticated("malformed authorization header"))?
        .trim();
    let token = match raw.strip_prefix("Bearer") {
        Some(rest) => rest.trim_start(),
        None => raw,
    };
    if token.is_empty() {
        return Err(Status::unauthenticated("missing bearer token"));
    }
    Ok(token.to_owned())
}

pub(crate) fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Builds the gRPC error response the middleware replies with when a request
/// is rejected before reaching the inner service.
pub(crate) fn status_response(status: Status) -> http::Response<tonic::body::BoxBody> {
    let mut response = http::Response::new(tonic::body::BoxBody::default());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response
        .headers_mut()
        .insert("grpc-status", http::HeaderValue::from(status.code() as i32));
    if !status.message().is_empty() {
        if let Ok(message) = http::HeaderValue::from_str(status.message()) {
            response.headers_mut().insert("grpc-message", message);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_metadata_copies_known_headers() {
        let mut incoming = MetadataMap::new();
        incoming.insert("authorization", "Bearer a0".parse().unwrap());
        incoming.insert("openai-organization", "o0".parse().unwrap());
        incoming.insert("openai-project", "p0".parse().unwrap());
        incoming.insert("x-unrelated", "nope".parse().unwrap());

        let mut outgoing = MetadataMap::new();
        carry_metadata(&incoming, &mut outgoing);

        assert_eq!(outgoing.get(AUTH_HEADER).unwrap(), "Bearer a0");
        assert_eq!(outgoing.get(ORG_HEADER).unwrap(), "o0");
        assert_eq!(outgoing.get(PROJECT_HEADER).unwrap(), "p0");
        assert!(outgoing.get("x-unrelated").is_none());
    }

    #[test]
    fn carry_metadata_skips_absent_headers() {
        let incoming = MetadataMap::new();
        let mut outgoing = MetadataMap::new();
        carry_metadata(&incoming, &mut outgoing);
        assert!(outgoing.get(AUTH_HEADER).is_none());
    }

    #[test]
    fn bearer_token_strips_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer token0".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "token0");
    }

    #[test]
    fn bearer_token_accepts_a_raw_credential() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "token0".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "token0");
    }

    #[test]
    fn bearer_token_rejects_missing_or_empty_credentials() {
        let headers = HeaderMap::new();
        assert_eq!(
            bearer_token(&headers).unwrap_err().code(),
            tonic::Code::Unauthenticated
        );

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer ".parse().unwrap());
        assert_eq!(
            bearer_token(&headers).unwrap_err().code(),
            tonic::Code::Unauthenticated
        );
    }

    #[test]
    fn status_response_carries_the_grpc_code() {
        let response = status_response(Status::permission_denied("permission denied"));
        assert_eq!(response.headers()["grpc-status"], "7");
        assert_eq!(response.headers()["grpc-message"], "permission denied");
    }
}
