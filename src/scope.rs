//! Controller scope - the narrow contract to an external DI container.
//!
//! The core never constructs controller state itself: before each
//! inbound call it asks the [`ScopeFactory`] for a fresh scope, hands
//! it to the handler through the action context, and disposes it after
//! the call returns. What a scope resolves, caches, or pools is
//! entirely the container's business; the core only drives the
//! begin/dispose lifecycle.

use std::any::Any;
use std::sync::Arc;

/// One per-request scope produced by a [`ScopeFactory`].
///
/// Handlers reach their container through [`ControllerScope::as_any`]
/// and a downcast to the concrete scope type.
pub trait ControllerScope: Send + Sync {
    /// Access the concrete scope type.
    fn as_any(&self) -> &dyn Any;

    /// Release per-request resources. Called exactly once, after the
    /// handler finishes (or fails).
    fn dispose(&self) {}
}

/// Creates a scope per inbound request.
pub trait ScopeFactory: Send + Sync {
    /// Begin a new per-request scope.
    fn begin_scope(&self) -> Arc<dyn ControllerScope>;
}

/// Scope with no state, used when no container is plugged in.
pub struct NoopScope;

impl ControllerScope for NoopScope {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory producing [`NoopScope`]s; the default.
pub struct NoopScopeFactory;

impl ScopeFactory for NoopScopeFactory {
    fn begin_scope(&self) -> Arc<dyn ControllerScope> {
        Arc::new(NoopScope)
    }
}
