//! WebSocket upgrade of accepted sockets, with optional Basic authentication.

use crate::error::ServerError;
use crate::stream::{Socket, WebSocket};
use lw3_protocol::Credentials;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};

/// Completes the WebSocket handshake on `socket`.
///
/// When `credentials` is set the upgrade request must carry a matching
/// `Authorization: Basic` header; anything else is answered with
/// `401 Unauthorized` and the connection is dropped.
pub async fn accept(
    socket: Socket,
    credentials: Option<&Credentials>,
) -> Result<WebSocket, ServerError> {
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        authorize(request, credentials)?;
        Ok(response)
    };
    tokio_tungstenite::accept_hdr_async(socket, callback)
        .await
        .map_err(|e| ServerError::WebSocket(e.to_string()))
}

fn authorize(request: &Request, expected: Option<&Credentials>) -> Result<(), ErrorResponse> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(Credentials::from_header);
    match presented {
        Some(ref credentials) if credentials == expected => Ok(()),
        Some(credentials) => {
            tracing::warn!(
                "WebSocket upgrade rejected: wrong password for '{}'",
                credentials.username
            );
            Err(unauthorized())
        }
        None => {
            tracing::warn!("WebSocket upgrade rejected: no credentials");
            Err(unauthorized())
        }
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"lw3\""),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_open_server_accepts_anyone() {
        assert!(authorize(&request(None), None).is_ok());
        assert!(authorize(&request(Some("Basic Zm9vOmJhcg==")), None).is_ok());
    }

    #[test]
    fn test_credentials_checked() {
        let expected = Credentials::new("user", "pass");
        let good = expected.to_header();
        let wrong = Credentials::new("user", "wrong").to_header();

        assert!(authorize(&request(Some(&good)), Some(&expected)).is_ok());

        let rejected = authorize(&request(Some(&wrong)), Some(&expected)).unwrap_err();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
        assert!(rejected.headers().contains_key(header::WWW_AUTHENTICATE));

        let missing = authorize(&request(None), Some(&expected)).unwrap_err();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    }
}
