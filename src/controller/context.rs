//! Action context passed to handlers.
//!
//! Gives an action everything it may need about the call: the
//! connection (for calling back into the peer), the caller's principal,
//! the wire-level action name, and the per-request controller scope.
//!
//! # Thread Safety
//!
//! `ActionContext` is `Clone` and can be moved freely into spawned
//! tasks; the underlying connection handle is channel-based and shared.

use std::sync::Arc;

use crate::auth::Principal;
use crate::codec::PayloadEncoding;
use crate::connection::Connection;
use crate::scope::ControllerScope;

/// Context passed to action handlers.
#[derive(Clone)]
pub struct ActionContext {
    /// Connection the request arrived on. Absent only in unit tests.
    connection: Option<Connection>,
    /// Full wire action name (`"Controller/Action"`).
    action_name: String,
    /// Correlation id; absent for notifications.
    uid: Option<u32>,
    /// Principal snapshot taken at permission-check time.
    principal: Principal,
    /// Codec the result will be serialized with.
    response_encoding: PayloadEncoding,
    /// Per-request controller scope.
    scope: Arc<dyn ControllerScope>,
}

impl ActionContext {
    pub(crate) fn new(
        connection: Connection,
        action_name: String,
        uid: Option<u32>,
        principal: Principal,
        response_encoding: PayloadEncoding,
        scope: Arc<dyn ControllerScope>,
    ) -> Self {
        Self {
            connection: Some(connection),
            action_name,
            uid,
            principal,
            response_encoding,
            scope,
        }
    }

    /// Context without a connection, for exercising handlers directly.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            connection: None,
            action_name: "Test/Test".to_string(),
            uid: Some(1),
            principal: Principal::anonymous(),
            response_encoding: PayloadEncoding::Json,
            scope: Arc::new(crate::scope::NoopScope),
        }
    }

    /// The connection this request arrived on.
    ///
    /// Use it to call actions back on the calling peer.
    ///
    /// # Panics
    ///
    /// Panics only in test contexts built without a connection.
    pub fn connection(&self) -> &Connection {
        self.connection
            .as_ref()
            .expect("action context without connection")
    }

    /// Full wire action name.
    #[inline]
    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    /// Correlation id, absent for notifications.
    #[inline]
    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    /// Check if this call is a notification (no response expected).
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.uid.is_none()
    }

    /// Principal of the caller at the time the request was admitted.
    #[inline]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Codec the action's result will be serialized with.
    #[inline]
    pub(crate) fn response_encoding(&self) -> PayloadEncoding {
        self.response_encoding
    }

    /// Per-request controller scope. Downcast via
    /// [`ControllerScope::as_any`] to reach a concrete container.
    pub fn scope(&self) -> &dyn ControllerScope {
        self.scope.as_ref()
    }
}

impl std::fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("action_name", &self.action_name)
            .field("uid", &self.uid)
            .field("authenticated", &self.principal.is_authenticated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_accessors() {
        let ctx = ActionContext::for_tests();
        assert_eq!(ctx.action_name(), "Test/Test");
        assert_eq!(ctx.uid(), Some(1));
        assert!(!ctx.is_notification());
        assert!(!ctx.principal().is_authenticated());
    }

    #[test]
    fn test_context_is_clone() {
        let ctx = ActionContext::for_tests();
        let ctx2 = ctx.clone();
        assert_eq!(ctx.action_name(), ctx2.action_name());
    }
}
