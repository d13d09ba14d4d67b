//! Dispatch pipeline for inbound requests.
//!
//! Runs on its own task per request, never on the receiver:
//!
//! 1. Split the action name into `(controller, action)`; a bare name
//!    defaults to the `Home` controller, an empty controller segment
//!    routes to the reserved auth actions.
//! 2. Resolve the controller, then the action binding.
//! 3. Check permissions (listener side only).
//! 4. Check argument arity, then deserialize positionally.
//! 5. Begin a controller scope, invoke the handler, dispose the scope.
//! 6. Map handler errors: `BadRequest` keeps its message, everything
//!    else is logged and becomes a bare internal-error response.
//! 7. Enqueue the response; notifications discard it instead.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

use crate::auth;
use crate::codec::JsonCodec;
use crate::connection::{Connection, Shared};
use crate::controller::{ActionContext, ActionError, Reply};
use crate::outbound::{FrameKind, Outbound};
use crate::protocol::{self, Header, Status};

/// Default controller for bare action names.
const DEFAULT_CONTROLLER: &str = "Home";

/// Handle one inbound request end to end.
pub(crate) async fn handle_request(shared: Arc<Shared>, header: Header, payload: Bytes) {
    let reply = run_pipeline(&shared, &header, payload).await;

    let Some(uid) = header.uid else {
        // Notification: the pipeline ran for its effects; the response
        // is discarded and no id was ever allocated.
        if reply.status != Status::Ok {
            debug!(
                action = ?header.action_name,
                status = ?reply.status,
                "notification handler result discarded"
            );
        }
        return;
    };

    let response_header = Header::response(
        reply.status,
        uid,
        reply.body.len() as u32,
        reply.encoding.header_value(),
    );
    let fragments = match protocol::encode_fragments(&response_header, &reply.body) {
        Ok(fragments) => fragments,
        Err(e) => {
            error!(error = %e, "response framing failed");
            let fallback = Reply::error(Status::InternalError, "Internal Server Error");
            let fallback_header =
                Header::response(fallback.status, uid, fallback.body.len() as u32, None);
            match protocol::encode_fragments(&fallback_header, &fallback.body) {
                Ok(fragments) => fragments,
                Err(_) => return,
            }
        }
    };

    if shared
        .enqueue(Outbound::Frame {
            fragments,
            kind: FrameKind::Response,
        })
        .is_err()
    {
        debug!("connection closing; response dropped");
    }
}

async fn run_pipeline(shared: &Arc<Shared>, header: &Header, payload: Bytes) -> Reply {
    let full_name = header.action_name.as_deref().unwrap_or_default();
    let (controller, action) = split_action(full_name);

    // Reserved internal actions live under the empty controller name.
    if controller.is_empty() {
        return auth::handle_reserved(shared, action, &payload).await;
    }

    let Some((binding, controller_anonymous)) = shared.registry.find(controller, action) else {
        return Reply::error(Status::NotFound, &format!("Action {} not found.", full_name));
    };

    let principal = shared.principal.read().clone();
    if shared.side == crate::connection::Side::Listener {
        if let Some(denied) = auth::check_permission(
            &principal,
            controller_anonymous,
            binding.allow_anonymous,
            &binding.full_name(),
        ) {
            return denied;
        }
    }

    let args = match JsonCodec::decode_args(&payload) {
        Ok(args) => args,
        Err(e) => return Reply::error(Status::BadRequest, &e.to_string()),
    };
    if args.len() != binding.arity {
        return Reply::error(Status::BadRequest, "Argument count mismatch.");
    }

    let scope = shared.scopes.begin_scope();
    let ctx = ActionContext::new(
        Connection {
            shared: shared.clone(),
        },
        binding.full_name(),
        header.uid,
        principal,
        binding.response_encoding,
        scope.clone(),
    );

    let result = binding.invoke(ctx, args).await;
    scope.dispose();

    match result {
        Ok(reply) => reply,
        Err(ActionError::BadRequest(message)) => Reply::error(Status::BadRequest, &message),
        Err(ActionError::Internal(message)) => {
            // Controller internals never cross the wire.
            error!(action = %binding.full_name(), error = %message, "action failed");
            Reply::error(Status::InternalError, "Internal Server Error")
        }
    }
}

/// Split `"Controller/Action"`; bare names belong to the default
/// controller, a leading slash yields an empty controller segment.
fn split_action(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((controller, action)) => (controller, action),
        None => (DEFAULT_CONTROLLER, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_action_forms() {
        assert_eq!(split_action("Math/Sum"), ("Math", "Sum"));
        assert_eq!(split_action("Ping"), ("Home", "Ping"));
        assert_eq!(split_action("/SignIn"), ("", "SignIn"));
        assert_eq!(split_action("A/B/C"), ("A", "B/C"));
    }
}
