use bytes::Bytes;
use http_body_util::Full;
use hyper::{StatusCode, header::CONTENT_TYPE};

use super::Response;


pub(crate) fn json(status: StatusCode, body: impl Into<Bytes>) -> Response {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .unwrap()
}

pub(crate) fn html(body: impl Into<Bytes>) -> Response {
    Response::builder()
        .header(CONTENT_TYPE, "text/html; charset=UTF-8")
        .body(Full::new(body.into()))
        .unwrap()
}

pub(crate) fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=UTF-8")
        .body(Full::new(body.into()))
        .unwrap()
}

pub(crate) fn not_found() -> Response {
    plain(StatusCode::NOT_FOUND, "404 Not found")
}

pub(crate) fn method_not_allowed() -> Response {
    plain(StatusCode::METHOD_NOT_ALLOWED, "405 Method not allowed")
}

pub(crate) fn bad_request(msg: Option<&str>) -> Response {
    let body = match msg {
        Some(s) => Bytes::from(s.to_owned()),
        None => Bytes::from_static(b"Bad request"),
    };
    plain(StatusCode::BAD_REQUEST, body)
}

pub(crate) fn payload_too_large() -> Response {
    plain(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
}

pub(crate) fn internal_server_error() -> Response {
    plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}
