//! JSON error responses for the admin API.
//!
//! Every failure leaving the admin surface is shaped as
//! `{"type": "...", "msg": "..."}`, with the type derived from the status
//! class: 4xx are `bad_request_error`, 5xx are `api_internal_error`.

use std::fmt;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{header, Response, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiErrorKind {
    #[serde(rename = "bad_request_error")]
    BadRequest,
    #[serde(rename = "api_internal_error")]
    Internal,
}

/// An admin API error: the HTTP status it maps to plus the wire shape.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub msg: String,
}

impl ApiError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn kind(&self) -> ApiErrorKind {
        if self.status.is_server_error() {
            ApiErrorKind::Internal
        } else {
            ApiErrorKind::BadRequest
        }
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let body = ApiErrorBody {
            kind: self.kind(),
            msg: self.msg,
        };
        let payload = serde_json::to_vec_pretty(&body)
            .unwrap_or_else(|_| br#"{"type":"api_internal_error","msg":"encoding error"}"#.to_vec());
        let mut resp = Response::new(Full::new(Bytes::from(payload)));
        *resp.status_mut() = self.status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        resp
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.msg)
    }
}

impl std::error::Error for ApiError {}

/// The JSON body of an admin API error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type")]
    pub kind: ApiErrorKind,
    pub msg: String,
}
