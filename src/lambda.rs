use crate::{error::Error, payload::RenderRequest, render::Dispatcher};
use axum::{
    body::Body,
    http::{header::CONTENT_LENGTH, Method, Request},
    response::IntoResponse,
    routing::any,
    Extension, Json, Router,
};
use http_body::{LengthLimitError, Limited};
use mime::Mime;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Default cap on request bodies, large enough for inline HTML with embedded images.
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Largest request body the handler reads.
#[derive(Debug, Clone, Copy)]
pub struct BodyLimit(pub usize);

/// Header name as it appears inside the envelope, which callers match exactly.
const ENVELOPE_CONTENT_TYPE: &str = "Content-Type";

/// Lambda proxy style envelope wrapped around every rendered document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LambdaResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
}

impl LambdaResponse {
    pub fn encoded(content_type: &Mime, bytes: &[u8]) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(ENVELOPE_CONTENT_TYPE.to_string(), content_type.to_string());

        Self {
            status_code: 200,
            headers,
            body: Some(base64::encode(bytes)),
            is_base64_encoded: true,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(ENVELOPE_CONTENT_TYPE))
            .map(|(_, value)| value.as_str())
    }

    pub fn decode_body(&self) -> anyhow::Result<Vec<u8>> {
        let body = self.body.as_deref().unwrap_or_default();
        if self.is_base64_encoded {
            Ok(base64::decode(body)?)
        } else {
            Ok(body.as_bytes().to_vec())
        }
    }
}

impl IntoResponse for LambdaResponse {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

async fn read_body(body: Body, limit: usize) -> Result<hyper::body::Bytes, Error> {
    hyper::body::to_bytes(Limited::new(body, limit))
        .await
        .map_err(|err| {
            if err.downcast_ref::<LengthLimitError>().is_some() {
                Error::PayloadTooLarge(limit)
            } else {
                Error::Body(err.to_string())
            }
        })
}

pub async fn handler(
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    Extension(BodyLimit(limit)): Extension<BodyLimit>,
    request: Request<Body>,
) -> Result<LambdaResponse, Error> {
    if request.method() != Method::POST {
        return Err(Error::MethodNotAllowed);
    }

    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.map_or(false, |length| length > limit) {
        return Err(Error::PayloadTooLarge(limit));
    }

    let body = read_body(request.into_body(), limit).await?;
    let payload: RenderRequest =
        serde_json::from_slice(&body).map_err(|err| Error::InvalidJson(err.to_string()))?;

    dispatcher.dispatch(&payload).await
}

/// Every path renders; the endpoint is gated on method alone.
pub fn router(dispatcher: Arc<Dispatcher>, body_limit: usize) -> Router {
    Router::new().fallback(any(handler)).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(Extension(dispatcher))
            .layer(Extension(BodyLimit(body_limit))),
    )
}
