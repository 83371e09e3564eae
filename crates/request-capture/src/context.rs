use crate::{CapturedMessage, Config, ErrorReport, RequestSnapshot};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// The Context of the request execution being polled. It's visible to everything
// within the call stack of a future wrapped by `enter()`, across every suspension
// point, and to nothing outside of it.
tokio::task_local! {
    static CURRENT: Context;
}

/// Context is a handle to the capture state of a single request execution.
/// Clones refer to the same state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    id: uuid::Uuid,
    config: Arc<Config>,
    request: RequestSnapshot,
    // Only ever locked by the execution which owns this Context,
    // or by futures it explicitly `propagate()`s the Context into.
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    messages: Vec<CapturedMessage>,
    captured_error: Option<ErrorReport>,
    end_user: EndUserState,
    intercepting: bool,
}

/// EndUser identifies the user of the application on whose behalf a request was made.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EndUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Additional application-defined attributes of the user.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// EndUserState distinguishes a user which was never set from one which was explicitly cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EndUserState {
    #[default]
    Unset,
    Cleared,
    Set(EndUser),
}

impl EndUserState {
    pub fn is_unset(&self) -> bool {
        matches!(self, EndUserState::Unset)
    }
}

impl serde::Serialize for EndUserState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            EndUserState::Set(user) => user.serialize(serializer),
            EndUserState::Unset | EndUserState::Cleared => serializer.serialize_none(),
        }
    }
}

/// Username substituted for a user which carries none of `id`, `email`, or `username`.
pub const EMPTY_USER_USERNAME: &str = "EMPTY_USER_PROVIDED - check your call to set_user.";

/// ContextPatch is a partial update of a Context. Fields which are None are left unchanged.
#[derive(Debug, Default)]
pub struct ContextPatch {
    pub captured_error: Option<ErrorReport>,
    pub end_user: Option<EndUserState>,
}

impl Context {
    pub fn new(config: Arc<Config>, request: RequestSnapshot) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4(),
                config,
                request,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn request(&self) -> &RequestSnapshot {
        &self.inner.request
    }

    pub fn messages(&self) -> Vec<CapturedMessage> {
        self.state().messages.clone()
    }

    pub fn captured_error(&self) -> Option<ErrorReport> {
        self.state().captured_error.clone()
    }

    pub fn end_user(&self) -> EndUserState {
        self.state().end_user.clone()
    }

    /// Apply a ContextPatch to this Context.
    pub fn apply(&self, patch: ContextPatch) {
        let ContextPatch {
            captured_error,
            end_user,
        } = patch;
        let mut state = self.state();

        if let Some(captured_error) = captured_error {
            state.captured_error = Some(captured_error);
        }
        if let Some(end_user) = end_user {
            state.end_user = end_user;
        }
    }

    /// Release all mutable state of this Context.
    /// Called as the request execution exits, however it exits.
    pub fn release(&self) {
        *self.state() = State::default();
    }

    pub(crate) fn push_message(&self, message: CapturedMessage) {
        let mut state = self.state();
        if state.intercepting {
            state.messages.push(message);
        }
    }

    pub(crate) fn clear_messages(&self) {
        self.state().messages.clear();
    }

    pub(crate) fn is_intercepting(&self) -> bool {
        self.state().intercepting
    }

    // Set whether output is intercepted, returning the prior setting.
    pub(crate) fn set_intercepting(&self, intercepting: bool) -> bool {
        std::mem::replace(&mut self.state().intercepting, intercepting)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock can't leave State logically inconsistent,
        // as every critical section is a single assignment or push.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("request", &self.inner.request)
            .finish_non_exhaustive()
    }
}

/// Run `body` with `context` as the current Context, returning its output unchanged.
pub async fn enter<F>(context: Context, body: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(context, body).await
}

/// Run the synchronous `body` with `context` as the current Context.
pub fn enter_sync<R>(context: Context, body: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(context, body)
}

/// Returns the current Context, or None if called outside of any request execution.
pub fn current() -> Option<Context> {
    CURRENT.try_with(Clone::clone).ok()
}

/// Invoke `f` with the current Context, if there is one.
pub fn with_current<R>(f: impl FnOnce(&Context) -> R) -> Option<R> {
    CURRENT.try_with(f).ok()
}

/// Shallow-merge `patch` into the current Context.
/// Returns false, having done nothing, if there is no current Context.
pub fn mutate(patch: ContextPatch) -> bool {
    with_current(|context| context.apply(patch)).is_some()
}

/// Set or clear the end user of the current request.
/// A user lacking all of `id`, `email`, and `username` is recorded with a placeholder username.
pub fn set_user(user: Option<EndUser>) -> bool {
    let end_user = match user {
        None => EndUserState::Cleared,
        Some(user) if user.id.is_some() || user.email.is_some() || user.username.is_some() => {
            EndUserState::Set(user)
        }
        Some(_) => EndUserState::Set(EndUser {
            username: Some(EMPTY_USER_USERNAME.to_string()),
            ..Default::default()
        }),
    };

    mutate(ContextPatch {
        end_user: Some(end_user),
        ..Default::default()
    })
}

/// Task-locals don't carry into futures passed to `tokio::spawn()`.
/// Wrap such a future with `propagate()` to have it observe the current Context,
/// and to have its output captured into the current request.
pub fn propagate<F>(fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let context = current();

    async move {
        match context {
            Some(context) => CURRENT.scope(context, fut).await,
            None => fut.await,
        }
    }
}
