//! Protocol checks applied to every tunnel request

use hyper::header::{HeaderValue, ALLOW};
use hyper::{Method, Request, Response, StatusCode, Version};
use thiserror::Error;
use vicar_transport::{text_response, TunnelBody};

/// Per-request protocol violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("HTTP2 required")]
    Http2Required(Version),

    #[error("Method not allowed")]
    MethodNotAllowed(Method),
}

impl ProtocolError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::Http2Required(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ProtocolError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    pub fn into_response(self) -> Response<TunnelBody> {
        let mut response = text_response(self.status(), self.to_string());
        if let ProtocolError::MethodNotAllowed(_) = self {
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
        }
        response
    }
}

/// Tunnel requests must be HTTP/2 POSTs
///
/// The version check comes first: an HTTP/1.x request is refused with 505
/// whatever its method or path.
pub fn check<B>(req: &Request<B>) -> Result<(), ProtocolError> {
    if req.version() < Version::HTTP_2 {
        return Err(ProtocolError::Http2Required(req.version()));
    }
    if req.method() != Method::POST {
        return Err(ProtocolError::MethodNotAllowed(req.method().clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, version: Version) -> Request<()> {
        Request::builder()
            .method(method)
            .version(version)
            .uri("/web")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_http1_always_rejected() {
        for method in [Method::POST, Method::GET, Method::PUT] {
            for version in [Version::HTTP_09, Version::HTTP_10, Version::HTTP_11] {
                let err = check(&request(method.clone(), version)).unwrap_err();
                assert_eq!(err.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
            }
        }
    }

    #[test]
    fn test_http2_requires_post() {
        assert!(check(&request(Method::POST, Version::HTTP_2)).is_ok());

        let err = check(&request(Method::GET, Version::HTTP_2)).unwrap_err();
        assert_eq!(err, ProtocolError::MethodNotAllowed(Method::GET));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");
    }

    #[test]
    fn test_error_bodies() {
        assert_eq!(
            ProtocolError::Http2Required(Version::HTTP_11).to_string(),
            "HTTP2 required"
        );
        assert_eq!(
            ProtocolError::MethodNotAllowed(Method::GET).to_string(),
            "Method not allowed"
        );
    }
}
