use crate::context;

/// ErrorReport is an owned, serializable rendering of an error and its chain of sources.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Display rendering of the outermost error.
    pub message: String,
    /// Display renderings of each source, outermost first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    /// Debug rendering of the error, which typically names its concrete type and variant.
    pub detail: String,
    /// Captured backtrace, if one was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl ErrorReport {
    pub fn new(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut sources = Vec::new();
        let mut next = error.source();

        while let Some(source) = next {
            sources.push(source.to_string());
            next = source.source();
        }

        Self {
            message: error.to_string(),
            sources,
            detail: format!("{error:?}"),
            backtrace: None,
        }
    }

    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        let backtrace = error.backtrace();
        let backtrace = match backtrace.status() {
            std::backtrace::BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };

        Self {
            message: error.to_string(),
            sources: error.chain().skip(1).map(ToString::to_string).collect(),
            detail: format!("{error:?}"),
            backtrace,
        }
    }

    /// Build an ErrorReport from only the Display and Debug renderings of an error.
    /// Use this for error types which don't implement `std::error::Error`.
    pub fn from_display<E>(error: &E) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + ?Sized,
    {
        Self {
            message: error.to_string(),
            sources: Vec::new(),
            detail: format!("{error:?}"),
            backtrace: None,
        }
    }
}

/// Record `error` as the most specific error of the current request.
/// A later capture replaces an earlier one. Returns false and does nothing
/// if called outside of a request context.
pub fn capture_error(error: &(dyn std::error::Error + 'static)) -> bool {
    capture_report(ErrorReport::new(error))
}

/// Record an `anyhow::Error` as the most specific error of the current request.
pub fn capture_anyhow(error: &anyhow::Error) -> bool {
    capture_report(ErrorReport::from_anyhow(error))
}

/// Record a pre-built ErrorReport as the most specific error of the current request.
pub fn capture_report(report: ErrorReport) -> bool {
    context::mutate(context::ContextPatch {
        captured_error: Some(report),
        ..Default::default()
    })
}
