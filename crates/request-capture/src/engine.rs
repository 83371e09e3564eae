use crate::context::{self, Context};
use crate::triage::{self, Decision, HandlerOutcome, Observe, ResponseSummary, Thrown};
use crate::{
    CaptureLayer, Config, DiagnosticReport, Dispatcher, Interceptor, RequestSnapshot, SetupError,
    EXCLUDE_FROM_CAPTURE,
};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Engine wraps handler invocations with request capture.
/// It's independent of any particular invocation convention:
/// adapters such as CaptureService build a RequestSnapshot and call `drive()`.
#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Engine {
    /// Build an Engine which sends reports to `dispatcher`.
    ///
    /// `config` isn't validated here: an Engine with an invalid Config
    /// invokes every handler directly, without capture, and logs why.
    pub fn new(config: Config, dispatcher: impl Dispatcher) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Returns a tower Layer which wraps services with this Engine.
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer::new(self.clone())
    }

    /// Drive a single invocation of `handler` under request capture.
    ///
    /// The outcome of `handler` is returned exactly as it completed:
    /// a response is returned as-is, an error is returned unchanged after
    /// being classified by `describe`, and a panic is resumed after being reported.
    /// If capture can't be established the handler is invoked directly.
    pub async fn drive<R, E, H, Fut, D>(
        &self,
        request: RequestSnapshot,
        handler: H,
        describe: D,
    ) -> Result<R, E>
    where
        H: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: Observe,
        D: FnOnce(&E) -> Thrown,
    {
        let context = match self.setup(request) {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    { EXCLUDE_FROM_CAPTURE } = true,
                    "request capture is unavailable, invoking handler without it"
                );
                let decision = triage::decide(HandlerOutcome::PreInvocationFailure(err), None);
                debug_assert!(matches!(decision, Decision::Bypass), "{decision:?}");
                return handler().await;
            }
        };

        let mut cleanup = Cleanup {
            interceptor: Interceptor::new(context.clone()),
            context: context.clone(),
        };
        cleanup.interceptor.install();

        let completed = context::enter(
            context.clone(),
            AssertUnwindSafe(async move { handler().await }).catch_unwind(),
        )
        .await;

        // `outcome` is None if classifying the completion itself panicked,
        // in which case nothing is reported.
        let (completed, outcome) = match completed {
            Ok(Ok(mut response)) => {
                let status = response.status();

                let outcome = if triage::is_success(status) {
                    // Bodies of successful responses are never read.
                    Some(ResponseSummary { status, body: None })
                } else {
                    AssertUnwindSafe(response.inspect(self.config.max_body_bytes))
                        .catch_unwind()
                        .await
                        .map(|body| ResponseSummary { status, body })
                        .map_err(|panic| contained("inspecting the response", panic))
                        .ok()
                };
                (Ok(Ok(response)), outcome.map(HandlerOutcome::Success))
            }
            Ok(Err(err)) => {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| describe(&err)))
                    .map(HandlerOutcome::HandlerThrew)
                    .map_err(|panic| contained("describing the handler error", panic))
                    .ok();
                (Ok(Err(err)), outcome)
            }
            Err(panic) => {
                let thrown = Thrown::from_panic(panic.as_ref());
                (Err(panic), Some(HandlerOutcome::HandlerThrew(thrown)))
            }
        };
        cleanup.interceptor.restore();

        if let Some(outcome) = outcome {
            match triage::decide(outcome, Some(&context)) {
                Decision::Report(report) => self.dispatch(report),
                Decision::Pass | Decision::Bypass => (),
            }
        }
        drop(cleanup);

        match completed {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn setup(&self, request: RequestSnapshot) -> Result<Context, SetupError> {
        self.config.validate()?;
        Ok(Context::new(self.config.clone(), request))
    }

    fn dispatch(&self, report: DiagnosticReport) {
        let request_id = report.request_id;
        let status_code = report.status_code;

        match std::panic::catch_unwind(AssertUnwindSafe(|| self.dispatcher.send(report))) {
            Ok(Ok(())) => {
                tracing::debug!(
                    %request_id,
                    status_code,
                    { EXCLUDE_FROM_CAPTURE } = true,
                    "dispatched diagnostic report"
                );
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    %request_id,
                    ?error,
                    { EXCLUDE_FROM_CAPTURE } = true,
                    "failed to dispatch diagnostic report"
                );
            }
            Err(panic) => {
                tracing::warn!(
                    %request_id,
                    panic = ?Thrown::from_panic(panic.as_ref()),
                    { EXCLUDE_FROM_CAPTURE } = true,
                    "diagnostic report dispatcher panicked"
                );
            }
        }
    }
}

// Log a panic of the capture machinery which was caught while `stage`.
// The request's own outcome is unaffected, but it isn't reported.
fn contained(stage: &'static str, panic: Box<dyn Any + Send>) {
    tracing::warn!(
        stage,
        panic = ?Thrown::from_panic(panic.as_ref()),
        { EXCLUDE_FROM_CAPTURE } = true,
        "request capture panicked, skipping diagnostic report"
    );
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// Cleanup runs as a request execution exits, however it exits,
// including when the driving future is dropped before completion.
struct Cleanup {
    context: Context,
    interceptor: Interceptor,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.interceptor.restore();
        self.interceptor.clear_messages();
        self.context.release();
    }
}
