use crate::body::{buffer, snapshot_request, Buffered};
use crate::{Engine, ErrorReport, Observe, RequestSnapshot, Thrown};
use axum::body::Body;
use axum::http::{Request, Response};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::task::{Context, Poll};

/// CaptureLayer wraps services with request capture. Build one with `Engine::layer()`.
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    engine: Engine,
}

impl CaptureLayer {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

impl<S> tower::Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            engine: self.engine.clone(),
            inner,
        }
    }
}

/// CaptureService is a tower Service which drives each call of
/// its inner Service under request capture.
#[derive(Debug, Clone)]
pub struct CaptureService<S> {
    engine: Engine,
    inner: S,
}

impl<S> tower::Service<Request<Body>> for CaptureService<S>
where
    S: tower::Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Take the Service which was driven to readiness, leaving a clone in its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let engine = self.engine.clone();

        async move {
            // Don't buffer bodies for requests which won't be captured.
            let (request, snapshot) = match engine.config().validate() {
                Ok(()) => snapshot_request(request, engine.config()).await,
                Err(_) => (request, RequestSnapshot::default()),
            };

            engine
                .drive(
                    snapshot,
                    move || inner.call(request),
                    |err: &S::Error| Thrown::Error(ErrorReport::new(err)),
                )
                .await
        }
        .boxed()
    }
}

#[async_trait::async_trait]
impl Observe for Response<Body> {
    fn status(&self) -> u16 {
        Response::status(self).as_u16()
    }

    async fn inspect(&mut self, limit: usize) -> Option<serde_json::Value> {
        let body = std::mem::take(self.body_mut());
        let (body, buffered) = buffer(body, limit).await;
        *self.body_mut() = body;

        match buffered {
            Buffered::Complete(bytes) => serde_json::from_slice(&bytes).ok(),
            Buffered::Truncated(_) | Buffered::Failed => None,
        }
    }
}
