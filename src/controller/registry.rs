//! Controller registry - maps action names to invocable bindings.
//!
//! The registry is built once at startup from the registered
//! controllers and frozen behind an `Arc`. Lookups are case-insensitive
//! on both controller and action names, and an `Async` suffix on an
//! action name is trimmed at registration so source naming conventions
//! never leak onto the wire.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::context::ActionContext;
use crate::codec::PayloadEncoding;
use crate::protocol::Status;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type InvokeFn = Box<
    dyn Fn(ActionContext, Vec<serde_json::Value>) -> BoxFuture<'static, ActionResult>
        + Send
        + Sync,
>;

/// Error type for action handlers.
///
/// `BadRequest` is the only kind whose message crosses the wire;
/// everything else is logged locally and replaced with a generic
/// internal-error response.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Caller fault; the message is sent back verbatim.
    #[error("{0}")]
    BadRequest(String),

    /// Callee fault; logged, never sent to the peer.
    #[error("{0}")]
    Internal(String),
}

/// Result type for action handlers.
pub type ActionResult = std::result::Result<Reply, ActionError>;

impl From<crate::error::SockwireError> for ActionError {
    fn from(e: crate::error::SockwireError) -> Self {
        ActionError::Internal(e.to_string())
    }
}

/// A fully formed response body, ready to be framed.
///
/// Handlers normally return plain serializable values and never see
/// this type; returning a `Reply` directly (via
/// [`ControllerBuilder::action_reply`]) lets an action control its own
/// status and encoding.
#[derive(Debug)]
pub struct Reply {
    /// Response status.
    pub status: Status,
    /// Body codec.
    pub encoding: PayloadEncoding,
    /// Serialized body.
    pub body: Bytes,
}

impl Reply {
    /// Build a successful reply by serializing a value.
    pub fn ok<T: Serialize>(value: &T, encoding: PayloadEncoding) -> ActionResult {
        let body = encoding
            .encode(value)
            .map_err(|e| ActionError::Internal(format!("result serialization failed: {}", e)))?;
        Ok(Reply {
            status: Status::Ok,
            encoding,
            body: Bytes::from(body),
        })
    }

    /// Build a successful reply from pre-encoded bytes.
    pub fn ok_bytes(encoding: PayloadEncoding, body: Bytes) -> Reply {
        Reply {
            status: Status::Ok,
            encoding,
            body,
        }
    }

    /// Build an error reply. The message is carried as a JSON string.
    pub fn error(status: Status, message: &str) -> Reply {
        let body = serde_json::to_vec(message).unwrap_or_default();
        Reply {
            status,
            encoding: PayloadEncoding::Json,
            body: Bytes::from(body),
        }
    }
}

/// Immutable binding for one action, constructed at registration.
pub struct ActionBinding {
    /// Canonical controller name (as registered).
    pub controller: String,
    /// Canonical action name (`Async` suffix trimmed).
    pub action: String,
    /// Declared parameter count.
    pub arity: usize,
    /// Bypass the authentication check for this action.
    pub allow_anonymous: bool,
    /// Fire-and-forget: callers allocate no uid and expect no response.
    pub notification: bool,
    /// Best-effort hint to disable Nagle on the transport.
    pub no_delay: bool,
    /// Codec for the serialized result.
    pub response_encoding: PayloadEncoding,
    invoke: InvokeFn,
}

impl ActionBinding {
    /// `"Controller/Action"` as it appears on the wire.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.controller, self.action)
    }

    /// Invoke the bound handler.
    pub(crate) fn invoke(
        &self,
        ctx: ActionContext,
        args: Vec<serde_json::Value>,
    ) -> BoxFuture<'static, ActionResult> {
        (self.invoke)(ctx, args)
    }
}

impl std::fmt::Debug for ActionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBinding")
            .field("controller", &self.controller)
            .field("action", &self.action)
            .field("arity", &self.arity)
            .field("allow_anonymous", &self.allow_anonymous)
            .field("notification", &self.notification)
            .field("no_delay", &self.no_delay)
            .field("response_encoding", &self.response_encoding)
            .finish_non_exhaustive()
    }
}

struct ControllerEntry {
    /// Canonical name (as registered).
    name: String,
    /// Controller-level allow-anonymous marker.
    allow_anonymous: bool,
    /// Actions keyed by lowercase name.
    actions: HashMap<String, ActionBinding>,
}

/// Registry mapping controller and action names to bindings.
pub struct ControllerRegistry {
    /// Controllers keyed by lowercase name.
    controllers: HashMap<String, ControllerEntry>,
}

impl ControllerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            controllers: HashMap::new(),
        }
    }

    /// Get or create a controller and return its builder.
    pub fn controller(&mut self, name: &str) -> ControllerBuilder<'_> {
        let key = name.to_lowercase();
        let entry = self
            .controllers
            .entry(key)
            .or_insert_with(|| ControllerEntry {
                name: name.to_string(),
                allow_anonymous: false,
                actions: HashMap::new(),
            });
        ControllerBuilder { entry }
    }

    /// Check if a controller is registered (case-insensitive).
    pub fn controller_exists(&self, name: &str) -> bool {
        self.controllers.contains_key(&name.to_lowercase())
    }

    /// Look up an action binding.
    ///
    /// Returns the binding and the controller-level allow-anonymous
    /// marker. Matching is case-insensitive on both segments.
    pub fn find(&self, controller: &str, action: &str) -> Option<(&ActionBinding, bool)> {
        let entry = self.controllers.get(&controller.to_lowercase())?;
        let binding = entry.actions.get(&trim_async(action).to_lowercase())?;
        Some((binding, entry.allow_anonymous))
    }

    /// True if any registered action carries the no-delay hint.
    pub fn any_no_delay(&self) -> bool {
        self.controllers
            .values()
            .flat_map(|c| c.actions.values())
            .any(|a| a.no_delay)
    }

    /// Total number of registered actions.
    pub fn action_count(&self) -> usize {
        self.controllers.values().map(|c| c.actions.len()).sum()
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("controllers", &self.controllers.len())
            .field("actions", &self.action_count())
            .finish()
    }
}

/// Builder for one controller's actions and markers.
pub struct ControllerBuilder<'a> {
    entry: &'a mut ControllerEntry,
}

impl<'a> ControllerBuilder<'a> {
    /// Mark every action of this controller as allow-anonymous.
    pub fn allow_anonymous(self) -> Self {
        self.entry.allow_anonymous = true;
        self
    }

    /// Register an action whose handler returns a serializable value.
    ///
    /// The handler receives the [`ActionContext`] and a typed argument
    /// tuple deserialized positionally from the request body.
    pub fn action<A, R, F, Fut>(self, name: &str, handler: F) -> ActionBuilder<'a>
    where
        A: ArgsTuple,
        R: Serialize + Send + 'static,
        F: Fn(ActionContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, ActionError>> + Send + 'static,
    {
        self.insert(name, wrap_value_handler(handler))
    }

    /// Register an action whose handler builds its own [`Reply`].
    pub fn action_reply<A, F, Fut>(self, name: &str, handler: F) -> ActionBuilder<'a>
    where
        A: ArgsTuple,
        F: Fn(ActionContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.insert(name, wrap_reply_handler(handler))
    }

    fn insert(self, name: &str, (arity, invoke): (usize, InvokeFn)) -> ActionBuilder<'a> {
        let canonical = trim_async(name).to_string();
        let key = canonical.to_lowercase();

        let binding = ActionBinding {
            controller: self.entry.name.clone(),
            action: canonical,
            arity,
            allow_anonymous: false,
            notification: false,
            no_delay: false,
            response_encoding: PayloadEncoding::Json,
            invoke,
        };
        self.entry.actions.insert(key.clone(), binding);

        ActionBuilder {
            binding: self.entry.actions.get_mut(&key).expect("just inserted"),
        }
    }
}

/// Builder for per-action markers, returned by action registration.
pub struct ActionBuilder<'a> {
    binding: &'a mut ActionBinding,
}

impl ActionBuilder<'_> {
    /// Bypass the authentication check for this action.
    pub fn allow_anonymous(self) -> Self {
        self.binding.allow_anonymous = true;
        self
    }

    /// Mark as fire-and-forget: no uid, no pending entry, no response.
    pub fn notification(self) -> Self {
        self.binding.notification = true;
        self
    }

    /// Serialize the result with the binary codec instead of JSON.
    pub fn msgpack(self) -> Self {
        self.binding.response_encoding = PayloadEncoding::MsgPack;
        self
    }

    /// Best-effort hint to disable Nagle for this action's calls.
    pub fn no_delay(self) -> Self {
        self.binding.no_delay = true;
        self
    }
}

/// Trim a trailing `Async` suffix from a source-level method name.
fn trim_async(name: &str) -> &str {
    match name.strip_suffix("Async") {
        Some(base) if !base.is_empty() => base,
        _ => name,
    }
}

fn wrap_value_handler<A, R, F, Fut>(handler: F) -> (usize, InvokeFn)
where
    A: ArgsTuple,
    R: Serialize + Send + 'static,
    F: Fn(ActionContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, ActionError>> + Send + 'static,
{
    let invoke: InvokeFn = Box::new(move |ctx, values| {
        let encoding = ctx.response_encoding();
        let args = match A::from_values(values) {
            Ok(args) => args,
            Err(e) => {
                let e = ActionError::BadRequest(e.to_string());
                return Box::pin(async move { Err(e) });
            }
        };
        let fut = handler(ctx, args);
        Box::pin(async move {
            let value = fut.await?;
            Reply::ok(&value, encoding)
        })
    });
    (A::ARITY, invoke)
}

fn wrap_reply_handler<A, F, Fut>(handler: F) -> (usize, InvokeFn)
where
    A: ArgsTuple,
    F: Fn(ActionContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    let invoke: InvokeFn = Box::new(move |ctx, values| {
        let args = match A::from_values(values) {
            Ok(args) => args,
            Err(e) => {
                let e = ActionError::BadRequest(e.to_string());
                return Box::pin(async move { Err(e) });
            }
        };
        Box::pin(handler(ctx, args))
    });
    (A::ARITY, invoke)
}

/// Positional argument tuple.
///
/// Implemented for tuples up to six elements; used both to
/// deserialize inbound argument arrays and to build outbound ones.
pub trait ArgsTuple: Send + Sized + 'static {
    /// Number of positional arguments.
    const ARITY: usize;

    /// Deserialize from a positional value array.
    fn from_values(values: Vec<serde_json::Value>) -> serde_json::Result<Self>;

    /// Serialize into a positional value array.
    fn into_values(self) -> serde_json::Result<Vec<serde_json::Value>>;
}

impl ArgsTuple for () {
    const ARITY: usize = 0;

    fn from_values(values: Vec<serde_json::Value>) -> serde_json::Result<Self> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(serde::de::Error::custom("expected 0 arguments"))
        }
    }

    fn into_values(self) -> serde_json::Result<Vec<serde_json::Value>> {
        Ok(Vec::new())
    }
}

macro_rules! impl_args_tuple {
    ($len:expr; $($ty:ident : $idx:tt),+) => {
        impl<$($ty),+> ArgsTuple for ($($ty,)+)
        where
            $($ty: Serialize + DeserializeOwned + Send + 'static),+
        {
            const ARITY: usize = $len;

            fn from_values(values: Vec<serde_json::Value>) -> serde_json::Result<Self> {
                if values.len() != $len {
                    return Err(serde::de::Error::custom(format!(
                        "expected {} arguments, got {}",
                        $len,
                        values.len()
                    )));
                }
                let mut iter = values.into_iter();
                Ok(($(serde_json::from_value::<$ty>(
                    iter.next().expect("length checked")
                )?,)+))
            }

            fn into_values(self) -> serde_json::Result<Vec<serde_json::Value>> {
                Ok(vec![$(serde_json::to_value(self.$idx)?),+])
            }
        }
    };
}

impl_args_tuple!(1; A0: 0);
impl_args_tuple!(2; A0: 0, A1: 1);
impl_args_tuple!(3; A0: 0, A1: 1, A2: 2);
impl_args_tuple!(4; A0: 0, A1: 1, A2: 2, A3: 3);
impl_args_tuple!(5; A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
impl_args_tuple!(6; A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> ControllerRegistry {
        let mut registry = ControllerRegistry::new();
        registry
            .controller("Math")
            .action("Sum", |_ctx, (a, b): (i32, i32)| async move { Ok(a + b) });
        registry
            .controller("Secret")
            .action("Ping", |_ctx, (): ()| async move { Ok("pong") });
        registry
    }

    #[test]
    fn test_register_and_find() {
        let registry = test_registry();

        let (binding, ctrl_anon) = registry.find("Math", "Sum").unwrap();
        assert_eq!(binding.controller, "Math");
        assert_eq!(binding.action, "Sum");
        assert_eq!(binding.arity, 2);
        assert!(!ctrl_anon);
        assert_eq!(binding.full_name(), "Math/Sum");
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let registry = test_registry();

        assert!(registry.find("math", "sum").is_some());
        assert!(registry.find("MATH", "SUM").is_some());
        assert!(registry.find("Math", "sUm").is_some());
    }

    #[test]
    fn test_missing_controller_and_action() {
        let registry = test_registry();

        assert!(registry.find("Nope", "Nope").is_none());
        assert!(registry.find("Math", "Nope").is_none());
        assert!(registry.controller_exists("Math"));
        assert!(!registry.controller_exists("Nope"));
    }

    #[test]
    fn test_async_suffix_trimmed() {
        let mut registry = ControllerRegistry::new();
        registry
            .controller("Files")
            .action("ReadAsync", |_ctx, (): ()| async move { Ok(0u32) });

        let (binding, _) = registry.find("Files", "Read").unwrap();
        assert_eq!(binding.action, "Read");
        // The wire name also resolves when the caller sends the suffix.
        assert!(registry.find("Files", "ReadAsync").is_some());
    }

    #[test]
    fn test_bare_async_not_trimmed() {
        assert_eq!(trim_async("Async"), "Async");
        assert_eq!(trim_async("RunAsync"), "Run");
        assert_eq!(trim_async("Sum"), "Sum");
    }

    #[test]
    fn test_markers() {
        let mut registry = ControllerRegistry::new();
        registry
            .controller("Telemetry")
            .allow_anonymous()
            .action("Push", |_ctx, (_v,): (i64,)| async move { Ok(()) })
            .notification()
            .no_delay();
        registry
            .controller("Blobs")
            .action("Fetch", |_ctx, (_id,): (String,)| async move {
                Ok(Vec::<u8>::new())
            })
            .msgpack();

        let (push, ctrl_anon) = registry.find("Telemetry", "Push").unwrap();
        assert!(ctrl_anon);
        assert!(push.notification);
        assert!(push.no_delay);
        assert_eq!(push.response_encoding, PayloadEncoding::Json);

        let (fetch, _) = registry.find("Blobs", "Fetch").unwrap();
        assert_eq!(fetch.response_encoding, PayloadEncoding::MsgPack);

        assert!(registry.any_no_delay());
    }

    #[test]
    fn test_action_count() {
        let registry = test_registry();
        assert_eq!(registry.action_count(), 2);
    }

    #[tokio::test]
    async fn test_invoke_value_handler() {
        let registry = test_registry();
        let (binding, _) = registry.find("Math", "Sum").unwrap();

        let ctx = ActionContext::for_tests();
        let reply = binding
            .invoke(ctx, vec![serde_json::json!(2), serde_json::json!(3)])
            .await
            .unwrap();

        assert_eq!(reply.status, Status::Ok);
        assert_eq!(&reply.body[..], b"5");
    }

    #[tokio::test]
    async fn test_invoke_bad_args_maps_to_bad_request() {
        let registry = test_registry();
        let (binding, _) = registry.find("Math", "Sum").unwrap();

        let ctx = ActionContext::for_tests();
        let err = binding
            .invoke(ctx, vec![serde_json::json!("two"), serde_json::json!(3)])
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_reply_handler() {
        let mut registry = ControllerRegistry::new();
        registry
            .controller("Raw")
            .action_reply("Echo", |_ctx, (text,): (String,)| async move {
                Ok(Reply::ok_bytes(
                    PayloadEncoding::Json,
                    Bytes::from(serde_json::to_vec(&text).unwrap()),
                ))
            });

        let (binding, _) = registry.find("Raw", "Echo").unwrap();
        let reply = binding
            .invoke(
                ActionContext::for_tests(),
                vec![serde_json::json!("hello")],
            )
            .await
            .unwrap();
        assert_eq!(&reply.body[..], b"\"hello\"");
    }

    #[test]
    fn test_args_tuple_roundtrip() {
        let values = (1i32, "two".to_string(), true).into_values().unwrap();
        assert_eq!(values.len(), 3);

        let back: (i32, String, bool) = ArgsTuple::from_values(values).unwrap();
        assert_eq!(back, (1, "two".to_string(), true));
    }

    #[test]
    fn test_args_tuple_arity_mismatch() {
        let result: serde_json::Result<(i32, i32)> =
            ArgsTuple::from_values(vec![serde_json::json!(1)]);
        assert!(result.is_err());

        let result: serde_json::Result<()> = ArgsTuple::from_values(vec![serde_json::json!(1)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_reply_error_body_is_json_string() {
        let reply = Reply::error(Status::NotFound, "Action Nope/Nope not found.");
        assert_eq!(reply.status, Status::NotFound);
        let message: String = serde_json::from_slice(&reply.body).unwrap();
        assert!(message.contains("Nope"));
    }
}
