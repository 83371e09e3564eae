use crate::context::{self, Context};
use std::collections::BTreeMap;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context as LayerContext;

/// Events having a field of this name are never captured into a request's messages.
/// The capture machinery marks its own diagnostics with it, as otherwise a
/// warning about a failed dispatch would be captured into the next report.
pub const EXCLUDE_FROM_CAPTURE: &str = "exclude_from_capture";

/// Level of a CapturedMessage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// CapturedMessage is a diagnostic event emitted while a request was handled.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CapturedMessage {
    pub level: Level,
    /// Module path or explicit target of the emitting callsite.
    pub target: String,
    pub message: String,
    /// Structured fields of the event, other than its message.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "ts")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl CapturedMessage {
    pub fn new(level: tracing::Level, target: &str, message: impl Into<String>) -> Self {
        Self {
            level: Level::from(&level),
            target: target.to_string(),
            message: message.into(),
            fields: BTreeMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn from_event(event: &tracing::Event<'_>) -> Self {
        let metadata = event.metadata();
        let mut message = Self::new(*metadata.level(), metadata.target(), String::new());
        event.record(&mut FieldVisitor(&mut message));
        message
    }
}

/// FieldVisitor records the fields of an event into a CapturedMessage.
struct FieldVisitor<'m>(&'m mut CapturedMessage);

impl FieldVisitor<'_> {
    fn record(&mut self, field: &Field, value: serde_json::Value) {
        if field.name() == "message" {
            self.0.message = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.0.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record(field, serde_json::json!(value))
    }
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.into())
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.into())
    }
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, value.into())
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.into())
    }
    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record(field, value.to_string().into())
    }
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, format!("{value:?}").into())
    }
}

/// OutputLayer is a tracing Layer which appends each event into the messages
/// of the Context that's current at the moment the event is emitted.
/// It's installed once into the process subscriber, and is inert for events
/// emitted outside of a request, or within a request whose Interceptor isn't installed.
/// Other layers of the subscriber observe every event as usual.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputLayer {
    _private: (),
}

impl OutputLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S> tracing_subscriber::Layer<S> for OutputLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        if event
            .metadata()
            .fields()
            .field(EXCLUDE_FROM_CAPTURE)
            .is_some()
        {
            return;
        }

        let Some(context) = context::current() else {
            return;
        };
        if !context.is_intercepting() {
            return;
        }
        // Build the message outside of the Context lock,
        // as recording fields may run arbitrary Debug implementations.
        let message = CapturedMessage::from_event(event);
        context.push_message(message);
    }
}

/// Interceptor brackets a single request execution, turning on the capture
/// of output into its Context. Installation is idempotent, and the state
/// observed by the first `install()` is reinstated by `restore()`, which
/// also runs when the Interceptor is dropped.
pub struct Interceptor {
    context: Context,
    saved: Option<bool>,
}

impl Interceptor {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            saved: None,
        }
    }

    /// Begin capturing output into the Context.
    /// Returns false if this Interceptor was already installed.
    pub fn install(&mut self) -> bool {
        if self.saved.is_some() {
            return false;
        }
        self.saved = Some(self.context.set_intercepting(true));
        true
    }

    /// Reinstate the state captured by `install()`. A no-op if not installed.
    pub fn restore(&mut self) {
        if let Some(prior) = self.saved.take() {
            self.context.set_intercepting(prior);
        }
    }

    pub fn is_installed(&self) -> bool {
        self.saved.is_some()
    }

    pub fn clear_messages(&self) {
        self.context.clear_messages()
    }

    pub fn messages(&self) -> Vec<CapturedMessage> {
        self.context.messages()
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.restore()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, RequestSnapshot};
    use std::sync::Arc;
    use tracing::instrument::WithSubscriber;
    use tracing_subscriber::prelude::*;

    fn new_context() -> Context {
        Context::new(
            Arc::new(Config::new("cust", "code")),
            RequestSnapshot::default(),
        )
    }

    fn subscriber() -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::registry().with(OutputLayer::new())
    }

    fn texts(messages: &[CapturedMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.message.as_str()).collect()
    }

    #[test]
    fn test_captures_in_emission_order() {
        let ctx = new_context();

        tracing::subscriber::with_default(subscriber(), || {
            context::enter_sync(ctx.clone(), || {
                let mut interceptor = Interceptor::new(ctx.clone());
                tracing::info!("before install, not captured");

                assert!(interceptor.install());
                tracing::info!("a");
                tracing::warn!(attempt = 3, ok = false, "b");
                tracing::error!({ EXCLUDE_FROM_CAPTURE } = true, "internal, not captured");

                let messages = interceptor.messages();
                assert_eq!(texts(&messages), vec!["a", "b"]);
                assert_eq!(messages[1].level, Level::Warn);
                assert_eq!(messages[1].fields["attempt"], serde_json::json!(3));
                assert_eq!(messages[1].fields["ok"], serde_json::json!(false));

                interceptor.restore();
                tracing::info!("after restore, not captured");
                assert_eq!(texts(&interceptor.messages()), vec!["a", "b"]);

                interceptor.clear_messages();
                assert!(interceptor.messages().is_empty());
            })
        });
    }

    #[test]
    fn test_install_is_idempotent() {
        let ctx = new_context();
        let mut interceptor = Interceptor::new(ctx.clone());

        assert!(interceptor.install());
        assert!(!interceptor.install());
        assert!(ctx.is_intercepting());

        // A single restore reinstates the state from before the first install.
        interceptor.restore();
        assert!(!ctx.is_intercepting());
        assert!(!interceptor.is_installed());
    }

    #[test]
    fn test_drop_restores() {
        let ctx = new_context();
        {
            let mut interceptor = Interceptor::new(ctx.clone());
            interceptor.install();
            assert!(ctx.is_intercepting());
        }
        assert!(!ctx.is_intercepting());
    }

    #[tokio::test]
    async fn test_lookup_happens_at_emission_time() {
        let (first, second) = (new_context(), new_context());

        let run = |ctx: Context, label: &'static str| {
            context::enter(ctx.clone(), async move {
                let mut interceptor = Interceptor::new(ctx);
                interceptor.install();

                for i in 0..3 {
                    tracing::info!("{label}-{i}");
                    tokio::task::yield_now().await;
                }
            })
        };

        futures::future::join(run(first.clone(), "first"), run(second.clone(), "second"))
            .with_subscriber(subscriber())
            .await;

        // Both Interceptors were dropped, but messages remain until the Context is released.
        assert_eq!(
            texts(&first.messages()),
            vec!["first-0", "first-1", "first-2"]
        );
        assert_eq!(
            texts(&second.messages()),
            vec!["second-0", "second-1", "second-2"]
        );
    }
}
