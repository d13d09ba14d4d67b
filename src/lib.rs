//! # sockwire
//!
//! Symmetric, bidirectional RPC over a single persistent WebSocket
//! connection. Either peer may call *actions* the other side groups
//! into *controllers*; the wire protocol and dispatch machinery are
//! identical in both directions. The peer that dialed is the client
//! only in the sense that it opened the socket.
//!
//! ## Architecture
//!
//! - **Wire**: payload bytes followed by a trailing self-delimited
//!   header; one logical message per binary WebSocket message.
//! - **Calls**: a pending-request table correlates uids with awaiters;
//!   notifications skip the table entirely.
//! - **Lifecycle**: Open → Draining → Closed, driven by an atomic
//!   in-flight counter; graceful shutdown drains outstanding work up
//!   to a timeout before the close handshake.
//!
//! ## Example
//!
//! ```ignore
//! use sockwire::{ClientConfig, ControllerRegistry, RpcClient, RpcServer};
//!
//! // Listener
//! let mut controllers = ControllerRegistry::new();
//! controllers
//!     .controller("Math")
//!     .allow_anonymous()
//!     .action("Sum", |_ctx, (a, b): (i32, i32)| async move { Ok(a + b) });
//! let server = RpcServer::bind("127.0.0.1:4000", controllers).await?;
//! tokio::spawn(server.serve());
//!
//! // Dialer
//! let client = RpcClient::builder(ClientConfig::new("ws://127.0.0.1:4000")).build();
//! let sum: i32 = client.call("Math/Sum", (2, 3)).await?;
//! assert_eq!(sum, 5);
//! ```

pub mod auth;
pub mod codec;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod scope;

mod client;
mod connection;
mod dispatch;
mod outbound;
mod pending;
mod proxy;
mod server;

pub use auth::{Claims, JwtVault, Principal, TokenError, TokenVault};
pub use client::{ClientConfig, RpcClient, RpcClientBuilder, ShutdownOutcome, TokenProvider};
pub use connection::{CloseKind, CloseReason, Connection, ConnectionOptions};
pub use controller::{ActionContext, ActionError, ArgsTuple, ControllerRegistry, Reply};
pub use error::{Result, SockwireError};
pub use pending::ResponsePayload;
pub use protocol::Status;
pub use proxy::{Proxy, RequestDescriptor};
pub use server::{RpcServer, ServerConfig};
