//! The request handler consumed by the server.

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::future::Future;

/// Response body type produced by handlers.
pub type Body = Full<Bytes>;

/// Error type handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one request and produces a response.
///
/// Implemented for any `Fn(Request<Incoming>) -> impl Future<Output = Result<Response<Body>, BoxError>>`.
/// An `Err` is answered with `500 Internal Server Error` carrying the error text.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, Result<Response<Body>, BoxError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, BoxError>> + Send + 'static,
{
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, Result<Response<Body>, BoxError>> {
        Box::pin(self(req))
    }
}

/// Build a plain-text response.
pub fn text(status: hyper::StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    #[test]
    fn test_text_response() {
        let response = text(StatusCode::NOT_FOUND, "Not found\n");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_closure_is_handler() {
        fn assert_handler<H: Handler>(_: &H) {}

        let handler = |_req: Request<Incoming>| async {
            Ok::<_, BoxError>(text(StatusCode::OK, "ok"))
        };
        assert_handler(&handler);
    }
}
