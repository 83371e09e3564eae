use crate::Config;
use axum::body::Body;
use axum::http;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use std::collections::BTreeMap;

/// RequestSnapshot is the view of an inbound request which is attached to reports.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Request body, as JSON if it parses as such and otherwise as (lossy) UTF-8 text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Set if `body` holds only a prefix of a larger body.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub body_truncated: bool,
}

pub const REDACTED: &str = "[redacted]";

impl RequestSnapshot {
    /// Snapshot the method, URL, and headers of request `parts`, redacting headers per `config`.
    pub fn from_parts(parts: &http::request::Parts, config: &Config) -> Self {
        let mut headers = BTreeMap::<String, String>::new();

        for (name, value) in parts.headers.iter() {
            let value = if config.is_redacted(name.as_str()) {
                std::borrow::Cow::Borrowed(REDACTED)
            } else {
                String::from_utf8_lossy(value.as_bytes())
            };

            headers
                .entry(name.as_str().to_string())
                .and_modify(|prior| {
                    prior.push_str(", ");
                    prior.push_str(&value);
                })
                .or_insert_with(|| value.into_owned());
        }

        Self {
            method: parts.method.as_str().to_string(),
            url: parts.uri.to_string(),
            headers,
            body: None,
            body_truncated: false,
        }
    }
}

/// Snapshot an inbound request ahead of its handler.
///
/// If body capture is enabled, the body is buffered (up to `config.max_body_bytes`)
/// and the returned request carries a new body having exactly the same bytes,
/// in the same order, with any read error re-delivered at the position it occurred.
/// The handler thus reads a body which is indistinguishable from the original,
/// while the snapshot holds its own independent copy.
///
/// If body capture is disabled, the request is returned unchanged and no body is retained.
pub async fn snapshot_request(
    request: http::Request<Body>,
    config: &Config,
) -> (http::Request<Body>, RequestSnapshot) {
    let (parts, body) = request.into_parts();
    let mut snapshot = RequestSnapshot::from_parts(&parts, config);

    if config.exclude_request_body {
        return (http::Request::from_parts(parts, body), snapshot);
    }

    let (body, buffered) = buffer(body, config.max_body_bytes).await;

    match buffered {
        Buffered::Complete(bytes) => {
            snapshot.body = render(&bytes);
        }
        Buffered::Truncated(prefix) => {
            snapshot.body = Some(String::from_utf8_lossy(&prefix).into_owned().into());
            snapshot.body_truncated = true;
        }
        Buffered::Failed => (),
    }

    (http::Request::from_parts(parts, body), snapshot)
}

/// Outcome of buffering a Body.
#[derive(Debug, PartialEq)]
pub(crate) enum Buffered {
    /// The complete body.
    Complete(Bytes),
    /// The body exceeded the limit, and this is its leading prefix.
    Truncated(Bytes),
    /// The body failed to read.
    Failed,
}

/// Read `body` into memory up to `limit` bytes, returning a replacement Body
/// which replays everything that was read followed by everything that wasn't.
pub(crate) async fn buffer(body: Body, limit: usize) -> (Body, Buffered) {
    let mut rest = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut len = 0;

    loop {
        match rest.next().await {
            None => {
                let bytes = concat(&chunks, len);
                return (Body::from(bytes.clone()), Buffered::Complete(bytes));
            }
            Some(Ok(chunk)) if len + chunk.len() <= limit => {
                len += chunk.len();
                chunks.push(chunk);
            }
            Some(Ok(chunk)) => {
                let mut prefix = BytesMut::with_capacity(limit);
                for c in &chunks {
                    prefix.extend_from_slice(c);
                }
                prefix.extend_from_slice(&chunk[..limit - len]);

                chunks.push(chunk);
                let replay = stream::iter(chunks.into_iter().map(Ok)).chain(rest);

                return (Body::from_stream(replay), Buffered::Truncated(prefix.freeze()));
            }
            Some(Err(err)) => {
                let replay = stream::iter(
                    chunks
                        .into_iter()
                        .map(Ok)
                        .chain(std::iter::once(Err(err))),
                )
                .chain(rest);

                return (Body::from_stream(replay), Buffered::Failed);
            }
        }
    }
}

fn concat(chunks: &[Bytes], len: usize) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [only] => only.clone(),
        _ => {
            let mut out = BytesMut::with_capacity(len);
            for chunk in chunks {
                out.extend_from_slice(chunk);
            }
            out.freeze()
        }
    }
}

// Render a non-empty body as JSON if it parses, or as text otherwise.
fn render(bytes: &Bytes) -> Option<serde_json::Value> {
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(_) => Some(String::from_utf8_lossy(bytes).into_owned().into()),
    }
}
