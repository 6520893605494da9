use axum::{
    http::{header::ALLOW, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Everything that ends a request without an envelope.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Payload too large: limit is {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Failed to read request body: {0}")]
    Body(String),

    #[error("No valid payload found")]
    NoValidPayload,

    #[error("Error: {0}")]
    Render(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Error::InvalidJson(_) | Error::NoValidPayload => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Body(_) | Error::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();
        if let Error::MethodNotAllowed = self {
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
        }
        response
    }
}
