// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Response plumbing shared by every handler: JSON bodies with pre-computed
//! lengths, the uniform error shape, and the standard header sets.

use crate::auth::AuthError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use axum::body::{boxed, Empty, Full};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use master_protocol::error::{ErrorCode, ErrorDto};
use serde::Serialize;

pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// Handler-level failure: a wire code plus a human-readable message.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub msg: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    /// The code with its stock message.
    pub fn code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, msg)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        if let AuthError::Storage(storage) = &e {
            log::error!("storage failure in auth pipeline: {}", storage);
        }
        Self::new(e.code(), e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let code = match e {
            RegistryError::DuplicateAuthAddr => ErrorCode::DuplicateServer,
            _ => ErrorCode::BadRequest,
        };
        Self::new(code, e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        log::error!("storage failure: {}", e);
        Self::code(ErrorCode::InternalServerError)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        resp_json(status, &ErrorDto::new(self.code, self.msg), false)
    }
}

/// Serializes `value` and emits it with `Content-Type`, an explicit
/// `Content-Length`, and no body when answering a HEAD request.
pub fn resp_json<T: Serialize>(status: StatusCode, value: &T, head: bool) -> Response {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            log::error!("response serialization failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    resp_json_bytes(status, body, head)
}

/// Same, for a body that is already JSON bytes.
pub fn resp_json_bytes(status: StatusCode, body: Vec<u8>, head: bool) -> Response {
    let builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .header(CONTENT_LENGTH, body.len());
    let body = if head {
        boxed(Empty::new())
    } else {
        boxed(Full::from(body))
    };
    builder.body(body).expect("static response parts are valid")
}

pub fn is_head(method: &Method) -> bool {
    method == Method::HEAD
}

/// `204 No Content` with the route's method list, for OPTIONS preflights.
pub fn options_response(allow: &'static str) -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(ALLOW, allow)
        .body(boxed(Empty::new()))
        .expect("static response parts are valid")
}

/// Authenticated endpoints must never be cached by intermediaries.
pub fn no_store(mut response: Response) -> Response {
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("private, no-cache, no-store"),
    );
    response
}

/// The public read endpoints are intentionally embeddable anywhere.
pub fn cors_any(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_response_sets_length_and_type() {
        let response = resp_json(StatusCode::OK, &json!({"success": true}), false);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_JSON
        );
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "16");
    }

    #[test]
    fn head_keeps_length_but_drops_body() {
        let response = resp_json(StatusCode::OK, &json!({"success": true}), true);
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "16");
    }

    #[test]
    fn options_shape() {
        let response = options_response("GET, HEAD, OPTIONS");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET, HEAD, OPTIONS");
    }

    #[test]
    fn error_mapping() {
        let error: ApiError = RegistryError::DuplicateAuthAddr.into();
        assert_eq!(error.code, ErrorCode::DuplicateServer);
        let error: ApiError = RegistryError::ServerNotFound.into();
        assert_eq!(error.code, ErrorCode::BadRequest);
        let error: ApiError = AuthError::UnauthorizedPwd.into();
        assert_eq!(error.code, ErrorCode::UnauthorizedPwd);
    }
}
