//! Proxy invoker - turns interface-style calls into protocol requests.
//!
//! Code generation is out of scope for the core; all a generated (or
//! hand-written) proxy needs is a [`RequestDescriptor`] and a
//! connection to send it on. [`Proxy`] is the hand-written flavor: a
//! controller-scoped view over a client that routes every call through
//! the connection manager.

use serde::de::DeserializeOwned;

use crate::client::RpcClient;
use crate::controller::ArgsTuple;
use crate::error::Result;
use crate::pending::ResponsePayload;

/// Everything needed to put one call on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Remote action name (`"Controller/Action"` or bare).
    pub action_name: String,
    /// Positional arguments, already converted to JSON values.
    pub args: Vec<serde_json::Value>,
    /// Fire-and-forget: allocate no uid, await no response.
    pub notification: bool,
}

impl RequestDescriptor {
    /// Descriptor for a request/response call.
    pub fn call<A: ArgsTuple>(action_name: &str, args: A) -> Result<Self> {
        Ok(Self {
            action_name: action_name.to_string(),
            args: args.into_values()?,
            notification: false,
        })
    }

    /// Descriptor for a notification.
    pub fn notification<A: ArgsTuple>(action_name: &str, args: A) -> Result<Self> {
        Ok(Self {
            action_name: action_name.to_string(),
            args: args.into_values()?,
            notification: true,
        })
    }
}

impl crate::connection::Connection {
    /// Send a descriptor on this connection.
    ///
    /// Request descriptors resolve to the raw response payload for the
    /// caller to decode; notification descriptors resolve to `None` as
    /// soon as the message is queued.
    pub async fn invoke(&self, descriptor: &RequestDescriptor) -> Result<Option<ResponsePayload>> {
        let body = crate::codec::JsonCodec::encode_args(&descriptor.args)?;
        if descriptor.notification {
            self.notify_raw(&descriptor.action_name, bytes::Bytes::from(body))?;
            Ok(None)
        } else {
            self.call_raw(&descriptor.action_name, bytes::Bytes::from(body))
                .await
                .map(Some)
        }
    }
}

/// A controller-scoped caller bound to a client.
///
/// Method calls become `"Controller/Action"` requests through the
/// client's connection manager, connecting on demand when auto-connect
/// is enabled.
#[derive(Clone)]
pub struct Proxy {
    client: RpcClient,
    controller: String,
}

impl Proxy {
    /// Create a proxy for one remote controller.
    pub fn new(client: RpcClient, controller: &str) -> Self {
        Self {
            client,
            controller: controller.to_string(),
        }
    }

    /// The remote controller name this proxy targets.
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Call an action on the proxied controller.
    pub async fn call<A, R>(&self, action: &str, args: A) -> Result<R>
    where
        A: ArgsTuple,
        R: DeserializeOwned,
    {
        self.client
            .call(&format!("{}/{}", self.controller, action), args)
            .await
    }

    /// Send a notification to the proxied controller.
    pub async fn notify<A: ArgsTuple>(&self, action: &str, args: A) -> Result<()> {
        self.client
            .notify(&format!("{}/{}", self.controller, action), args)
            .await
    }
}
