//! Controller module - action registration and dispatch bindings.
//!
//! Provides:
//! - [`ControllerRegistry`] - maps controller/action names to bindings
//! - [`ActionContext`] - handler view of the connection and caller
//!
//! # Example
//!
//! ```
//! use sockwire::controller::{ControllerRegistry, ActionError};
//!
//! let mut registry = ControllerRegistry::new();
//!
//! registry.controller("Math").action("Sum", |_ctx, (a, b): (i32, i32)| async move {
//!     Ok::<_, ActionError>(a + b)
//! });
//!
//! registry
//!     .controller("Secret")
//!     .action("Ping", |_ctx, (): ()| async move { Ok::<_, ActionError>("pong") });
//! ```

mod context;
mod registry;

pub use context::ActionContext;
pub use registry::{
    ActionBinding, ActionBuilder, ActionError, ActionResult, ArgsTuple, ControllerBuilder,
    ControllerRegistry, Reply,
};
