use crate::{Engine, Observe, RequestSnapshot, Thrown};
use std::future::Future;

/// Kind of an RPC-style procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

impl ProcedureKind {
    fn as_str(&self) -> &'static str {
        match self {
            ProcedureKind::Query => "QUERY",
            ProcedureKind::Mutation => "MUTATION",
            ProcedureKind::Subscription => "SUBSCRIPTION",
        }
    }
}

/// ProcedureCall describes an invocation of an RPC-style procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCall {
    /// Dotted path of the procedure, such as "widgets.create".
    pub path: String,
    pub kind: ProcedureKind,
    /// Decoded input of the procedure, if it has one.
    pub input: Option<serde_json::Value>,
}

impl ProcedureCall {
    // Procedures are snapshot with their kind as the method, their path as the URL,
    // and their input as the body.
    fn snapshot(self, exclude_input: bool) -> RequestSnapshot {
        RequestSnapshot {
            method: self.kind.as_str().to_string(),
            url: self.path,
            body: if exclude_input { None } else { self.input },
            ..Default::default()
        }
    }
}

// Settled is the Observe'd form of a procedure's output.
// Procedures have no status: any output that's returned is a success.
struct Settled<T>(T);

#[async_trait::async_trait]
impl<T: Send> Observe for Settled<T> {
    fn status(&self) -> u16 {
        200
    }

    async fn inspect(&mut self, _limit: usize) -> Option<serde_json::Value> {
        None
    }
}

/// Call the procedure `f` under request capture.
///
/// `Ok` outputs are returned untouched. An `Err` is reported as uncaught,
/// with status 500, and is then returned unchanged. Panics are reported and resumed.
///
/// An `Err` which is a string or JSON value, such as a bare error code,
/// is reported as the response body rather than as an error. Other errors
/// are described by their Display and Debug renderings, so that
/// `anyhow::Error` and `std::error::Error` implementations are equally accepted.
pub async fn call<T, E, F, Fut>(engine: &Engine, call: ProcedureCall, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Send,
    E: std::fmt::Display + std::fmt::Debug + 'static,
{
    let snapshot = call.snapshot(engine.config().exclude_request_body);

    engine
        .drive(
            snapshot,
            move || async move { f().await.map(Settled) },
            |err: &E| Thrown::from_raised(err),
        )
        .await
        .map(|Settled(output)| output)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{capture_error, ChannelDispatcher, Config, DiagnosticReport};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn engine(config: Config) -> (Engine, mpsc::Receiver<DiagnosticReport>) {
        let (dispatcher, rx) = ChannelDispatcher::new(16);
        (Engine::new(config, dispatcher), rx)
    }

    fn create_widget() -> ProcedureCall {
        ProcedureCall {
            path: "widgets.create".to_string(),
            kind: ProcedureKind::Mutation,
            input: Some(json!({"name": "sprocket"})),
        }
    }

    #[tokio::test]
    async fn test_ok_output_is_untouched() {
        let (engine, mut rx) = engine(Config::new("cust", "code"));

        let out = call(&engine, create_widget(), || async {
            Ok::<_, anyhow::Error>(vec![1, 2, 3])
        })
        .await;

        assert_eq!(out.unwrap(), vec![1, 2, 3]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_err_is_reported_and_returned() {
        let (engine, mut rx) = engine(Config::new("cust", "code"));

        let out: Result<(), _> = call(&engine, create_widget(), || async {
            Err(anyhow::anyhow!("insert failed").context("creating widget"))
        })
        .await;

        assert_eq!(format!("{:#}", out.unwrap_err()), "creating widget: insert failed");

        let report = rx.try_recv().unwrap();
        assert_eq!(report.status_code, 500);
        assert!(report.is_uncaught_exception);
        assert_eq!(report.request.method, "MUTATION");
        assert_eq!(report.request.url, "widgets.create");
        assert_eq!(report.request.body, Some(json!({"name": "sprocket"})));
        let error = report.error.unwrap();
        assert_eq!(error.message, "creating widget");
        assert_eq!(error.sources, vec!["insert failed".to_string()]);
        assert_eq!(report.resp_body, None);
    }

    #[tokio::test]
    async fn test_err_value_is_reported_as_body() {
        let (engine, mut rx) = engine(Config::new("cust", "code"));

        let out: Result<(), _> = call(&engine, create_widget(), || async { Err("E_DENIED") }).await;
        assert_eq!(out.unwrap_err(), "E_DENIED");

        let report = rx.try_recv().unwrap();
        assert_eq!(report.status_code, 500);
        assert!(report.is_uncaught_exception);
        assert_eq!(report.resp_body, Some(json!("E_DENIED")));
        assert_eq!(report.error, None);

        let out: Result<(), _> = call(&engine, create_widget(), || async {
            Err(json!({"code": "E_DENIED", "retry": false}))
        })
        .await;
        assert!(out.is_err());

        let report = rx.try_recv().unwrap();
        assert_eq!(
            report.resp_body,
            Some(json!({"code": "E_DENIED", "retry": false}))
        );
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn test_excluded_input_and_captured_error() {
        let mut config = Config::new("cust", "code");
        config.exclude_request_body = true;
        let (engine, mut rx) = engine(config);

        let _: Result<(), _> = call(&engine, create_widget(), || async {
            capture_error(&std::fmt::Error);
            Err("E_DENIED")
        })
        .await;

        let report = rx.try_recv().unwrap();
        assert_eq!(report.request.body, None);
        assert_eq!(report.resp_body, Some(json!("E_DENIED")));
        assert_eq!(
            report.error.unwrap().message,
            "an error occurred when formatting an argument"
        );
    }
}
