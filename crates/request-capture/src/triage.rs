use crate::{ConfigError, Context, DiagnosticReport, ErrorReport};
use std::any::Any;

/// Response body reported when a failed response's body couldn't be parsed as JSON.
pub const UNPARSEABLE_BODY: &str = "Unknown error; json parsing failed.";

/// Status reported for handlers which raised an error or panicked.
pub const UNCAUGHT_STATUS: u16 = 500;

/// HandlerOutcome is how a wrapped handler completed. It's built once,
/// at the boundary of the handler invocation, and drives all triage.
#[derive(Debug)]
pub enum HandlerOutcome<R> {
    /// The handler returned a response.
    Success(R),
    /// The handler raised an error or panicked.
    HandlerThrew(Thrown),
    /// The capture machinery failed before the handler was invoked.
    PreInvocationFailure(SetupError),
}

/// Thrown is what a handler raised, distinguishing errors from other values.
#[derive(Debug, Clone, PartialEq)]
pub enum Thrown {
    /// An error value, such as the `Err` of a handler or an error given to `std::panic::panic_any`.
    Error(ErrorReport),
    /// A value which isn't an error, such as the message of a `panic!` or a bare error code.
    Value(serde_json::Value),
}

impl Thrown {
    /// Classify the payload of a caught panic.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        classify(payload).unwrap_or_else(|| Thrown::Value("Box<dyn Any>".into()))
    }

    /// Classify a value which a handler returned as its error.
    /// Strings and JSON documents aren't errors, and are reported as the body.
    /// Anything else is an error, known at least by its Display and Debug renderings.
    pub fn from_raised<E>(raised: &E) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + 'static,
    {
        classify(raised).unwrap_or_else(|| Thrown::Error(ErrorReport::from_display(raised)))
    }
}

fn classify(raised: &dyn Any) -> Option<Thrown> {
    if let Some(message) = raised.downcast_ref::<&'static str>() {
        Some(Thrown::Value((*message).into()))
    } else if let Some(message) = raised.downcast_ref::<String>() {
        Some(Thrown::Value(message.clone().into()))
    } else if let Some(value) = raised.downcast_ref::<serde_json::Value>() {
        Some(Thrown::Value(value.clone()))
    } else if let Some(error) = raised.downcast_ref::<anyhow::Error>() {
        Some(Thrown::Error(ErrorReport::from_anyhow(error)))
    } else if let Some(error) = raised.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
        Some(Thrown::Error(ErrorReport::new(error.as_ref())))
    } else {
        None
    }
}

/// SetupError is a failure of the capture machinery before handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invalid capture configuration")]
    Config(#[from] ConfigError),
}

/// ResponseSummary is the triage-relevant view of a handler's response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSummary {
    pub status: u16,
    /// Best-effort JSON rendering of the response body.
    /// Only read for responses which aren't successful.
    pub body: Option<serde_json::Value>,
}

/// Observe is implemented by handler responses, to expose them to triage.
#[async_trait::async_trait]
pub trait Observe: Send {
    fn status(&self) -> u16;

    /// Read up to `limit` bytes of the response body as best-effort JSON.
    /// The body is replaced by one which is indistinguishable from the original.
    /// Only called for responses which aren't successful.
    async fn inspect(&mut self, limit: usize) -> Option<serde_json::Value>;
}

/// Decision is the verdict of triage.
#[derive(Debug)]
pub enum Decision {
    /// The request succeeded and there's nothing to report.
    Pass,
    /// Capture couldn't be established. The handler must be invoked without it.
    Bypass,
    /// The request failed, and this report should be dispatched.
    Report(DiagnosticReport),
}

/// Returns whether a response status is successful, and exempt from reporting.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Decide what, if anything, to report about a handler `outcome`.
/// `context` is None if capture couldn't be established for the request,
/// and otherwise holds everything gathered while its handler ran.
pub fn decide(outcome: HandlerOutcome<ResponseSummary>, context: Option<&Context>) -> Decision {
    let outcome = match outcome {
        HandlerOutcome::PreInvocationFailure(_) => return Decision::Bypass,
        HandlerOutcome::Success(ResponseSummary { status, .. }) if is_success(status) => {
            return Decision::Pass
        }
        outcome => outcome,
    };
    let Some(context) = context else {
        return Decision::Bypass;
    };
    let captured_error = context.captured_error();

    let (status_code, resp_body, error, is_uncaught_exception) = match outcome {
        HandlerOutcome::Success(ResponseSummary { status, body }) => (
            status,
            Some(body.unwrap_or_else(|| UNPARSEABLE_BODY.into())),
            captured_error,
            false,
        ),
        // An explicitly captured error is more specific than one raised at the boundary.
        HandlerOutcome::HandlerThrew(Thrown::Error(error)) => (
            UNCAUGHT_STATUS,
            None,
            Some(captured_error.unwrap_or(error)),
            true,
        ),
        // A non-error value is reported as the body, and is never made into an error.
        HandlerOutcome::HandlerThrew(Thrown::Value(value)) => {
            (UNCAUGHT_STATUS, Some(value), captured_error, true)
        }
        HandlerOutcome::PreInvocationFailure(_) => return Decision::Bypass,
    };

    Decision::Report(DiagnosticReport {
        request_id: context.id(),
        timestamp: chrono::Utc::now(),
        request: context.request().clone(),
        resp_body,
        status_code,
        messages: context.messages(),
        is_uncaught_exception,
        error,
        end_user: context.end_user(),
        config: context.config().as_ref().into(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CapturedMessage, Config, ContextPatch, RequestSnapshot};
    use serde_json::json;
    use std::sync::Arc;

    // A Context which captured messages "a" and "b", and optionally an error.
    fn context(captured_error: Option<ErrorReport>) -> Context {
        let ctx = Context::new(
            Arc::new(Config::new("cust", "code")),
            RequestSnapshot::default(),
        );
        ctx.set_intercepting(true);
        ctx.push_message(CapturedMessage::new(tracing::Level::INFO, "app", "a"));
        ctx.push_message(CapturedMessage::new(tracing::Level::WARN, "app", "b"));
        ctx.apply(ContextPatch {
            captured_error,
            ..Default::default()
        });
        ctx
    }

    fn error(message: &str) -> ErrorReport {
        ErrorReport::new(&std::io::Error::new(std::io::ErrorKind::Other, message))
    }

    fn as_report(decision: Decision) -> DiagnosticReport {
        match decision {
            Decision::Report(report) => report,
            other => panic!("expected a report, not {other:?}"),
        }
    }

    #[test]
    fn test_success_passes() {
        let ctx = context(None);
        for status in [200, 201, 204, 299] {
            let outcome = HandlerOutcome::Success(ResponseSummary { status, body: None });
            assert!(matches!(decide(outcome, Some(&ctx)), Decision::Pass));
        }
    }

    #[test]
    fn test_pre_invocation_failure_bypasses() {
        let outcome = HandlerOutcome::PreInvocationFailure(SetupError::Config(
            ConfigError::MissingCustomerId,
        ));
        assert!(matches!(decide(outcome, None), Decision::Bypass));

        let outcome = HandlerOutcome::Success(ResponseSummary {
            status: 500,
            body: None,
        });
        assert!(matches!(decide(outcome, None), Decision::Bypass));
    }

    #[test]
    fn test_failed_response_is_reported() {
        let ctx = context(Some(error("lookup failed")));
        let outcome = HandlerOutcome::Success(ResponseSummary {
            status: 404,
            body: Some(json!({"error": "not found"})),
        });
        let report = as_report(decide(outcome, Some(&ctx)));

        assert_eq!(report.request_id, ctx.id());
        assert_eq!(report.status_code, 404);
        assert!(!report.is_uncaught_exception);
        assert_eq!(report.resp_body, Some(json!({"error": "not found"})));
        assert_eq!(report.error, Some(error("lookup failed")));
        let messages: Vec<_> = report.messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b"]);
    }

    #[test]
    fn test_unparseable_body_uses_placeholder() {
        let ctx = context(None);
        for status in [302, 400, 503] {
            let outcome = HandlerOutcome::Success(ResponseSummary { status, body: None });
            let report = as_report(decide(outcome, Some(&ctx)));
            assert_eq!(report.resp_body, Some(json!(UNPARSEABLE_BODY)));
            assert_eq!(report.error, None);
        }
    }

    #[test]
    fn test_thrown_error_precedence() {
        let thrown = || HandlerOutcome::HandlerThrew(Thrown::Error(error("generic")));

        let report = as_report(decide(thrown(), Some(&context(None))));
        assert_eq!(report.status_code, 500);
        assert!(report.is_uncaught_exception);
        assert_eq!(report.error, Some(error("generic")));
        assert_eq!(report.resp_body, None);

        let captured = context(Some(error("specific")));
        let report = as_report(decide(thrown(), Some(&captured)));
        assert_eq!(report.error, Some(error("specific")));
    }

    #[test]
    fn test_thrown_value_is_body_not_error() {
        let thrown = || HandlerOutcome::HandlerThrew(Thrown::Value(json!("E_CODE_42")));

        let report = as_report(decide(thrown(), Some(&context(None))));
        assert_eq!(report.status_code, 500);
        assert!(report.is_uncaught_exception);
        assert_eq!(report.resp_body, Some(json!("E_CODE_42")));
        assert_eq!(report.error, None);

        let captured = context(Some(error("specific")));
        let report = as_report(decide(thrown(), Some(&captured)));
        assert_eq!(report.error, Some(error("specific")));
    }

    #[test]
    fn test_classify_panic_payloads() {
        let thrown = |payload: Box<dyn Any + Send>| Thrown::from_panic(payload.as_ref());

        assert_eq!(thrown(Box::new("static")), Thrown::Value(json!("static")));
        assert_eq!(
            thrown(Box::new("owned".to_string())),
            Thrown::Value(json!("owned"))
        );
        assert_eq!(thrown(Box::new(42u32)), Thrown::Value(json!("Box<dyn Any>")));
        assert!(matches!(
            thrown(Box::new(anyhow::anyhow!("an error"))),
            Thrown::Error(e) if e.message == "an error"
        ));
    }

    #[test]
    fn test_classify_raised_values() {
        assert_eq!(Thrown::from_raised(&"E_DENIED"), Thrown::Value(json!("E_DENIED")));
        assert_eq!(
            Thrown::from_raised(&"E_OWNED".to_string()),
            Thrown::Value(json!("E_OWNED"))
        );
        assert_eq!(
            Thrown::from_raised(&json!({"code": 7})),
            Thrown::Value(json!({"code": 7}))
        );

        let raised = anyhow::anyhow!("insert failed").context("creating widget");
        let Thrown::Error(report) = Thrown::from_raised(&raised) else {
            panic!("expected an error");
        };
        assert_eq!(report.message, "creating widget");
        assert_eq!(report.sources, vec!["insert failed".to_string()]);

        assert_eq!(
            Thrown::from_raised(&std::fmt::Error),
            Thrown::Error(ErrorReport::from_display(&std::fmt::Error))
        );
    }
}
