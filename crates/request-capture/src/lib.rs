//! Request-scoped diagnostic capture for request handlers.
//!
//! An Engine wraps each invocation of a handler with a request Context.
//! While the handler runs, `tracing` events it emits are captured into its
//! Context by the OutputLayer, and it may record its most specific error with
//! `capture_error()` and identify its user with `set_user()`. If the handler
//! fails, a DiagnosticReport is assembled and handed to a Dispatcher.
//! Successful handlers are observably unaffected.

mod body;
pub use body::{snapshot_request, RequestSnapshot, REDACTED};

mod capture;
pub use capture::{capture_anyhow, capture_error, capture_report, ErrorReport};

mod config;
pub use config::{Config, ConfigError, DEFAULT_ENVIRONMENT};

pub mod context;
pub use context::{
    set_user, Context, ContextPatch, EndUser, EndUserState, EMPTY_USER_USERNAME,
};

mod dispatch;
pub use dispatch::{ChannelDispatcher, Dispatcher, JsonWriteDispatcher};

mod engine;
pub use engine::Engine;

mod intercept;
pub use intercept::{CapturedMessage, Interceptor, Level, OutputLayer, EXCLUDE_FROM_CAPTURE};

mod middleware;
pub use middleware::{CaptureLayer, CaptureService};

pub mod procedure;

mod report;
pub use report::{DiagnosticReport, ReportConfig};

pub mod server;

pub mod triage;
pub use triage::{HandlerOutcome, Observe, SetupError, Thrown};
