//! Dialer-side connection manager.
//!
//! The client owns at most one connection at a time. Concurrent
//! `connect()` calls are serialized by an async connect mutex and all
//! observe the same in-flight attempt; the slot is re-checked under
//! the mutex so only the first waiter dials. Shutdown races are
//! resolved explicitly: a shutdown request recorded before the
//! handshake finishes aborts it, and one recorded between handshake
//! and installation shuts the fresh connection down again.
//!
//! # Example
//!
//! ```ignore
//! use sockwire::{ClientConfig, RpcClient};
//!
//! let client = RpcClient::builder(ClientConfig::new("ws://127.0.0.1:4000")).build();
//! let sum: i32 = client.call("Math/Sum", (2, 3)).await?;
//! client.shutdown(std::time::Duration::from_secs(5), "done").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{watch, Notify};
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, warn};

use crate::connection::{CloseReason, Connection, ConnectionOptions, Side};
use crate::controller::{ArgsTuple, ControllerRegistry};
use crate::error::{Result, SockwireError};
use crate::scope::{NoopScopeFactory, ScopeFactory};

/// Produces the auto-authentication token, if any.
pub type TokenProvider = Box<dyn Fn() -> Option<Vec<u8>> + Send + Sync>;

/// Configuration for the dialer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URI (`ws://host:port` or `wss://host:port`).
    pub url: String,
    /// Connect implicitly on the first call. When disabled, calls
    /// without an open connection fail with `ConnectionNotOpen`.
    pub auto_connect: bool,
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Closes the connection when nothing arrives for this long.
    pub receive_timeout: Duration,
    /// Ping cadence; `None` disables keep-alive pings.
    pub keep_alive_interval: Option<Duration>,
    /// Largest accepted payload.
    pub max_payload: u32,
}

impl ClientConfig {
    /// Config with defaults for the given server URI.
    pub fn new(url: &str) -> Self {
        let defaults = ConnectionOptions::default();
        Self {
            url: url.to_string(),
            auto_connect: true,
            connect_timeout: Duration::from_secs(10),
            receive_timeout: defaults.receive_timeout,
            keep_alive_interval: defaults.keep_alive_interval,
            max_payload: defaults.max_payload,
        }
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            receive_timeout: self.receive_timeout,
            keep_alive_interval: self.keep_alive_interval,
            max_payload: self.max_payload,
        }
    }
}

/// Result of a client shutdown.
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownOutcome {
    /// A live connection was drained and closed.
    Connection(CloseReason),
    /// No connection existed; nothing to drain.
    NoConnectionGracefully,
}

struct ShutdownTicket {
    reason: String,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct ClientState {
    connection: Option<Connection>,
    shutdown: Option<ShutdownTicket>,
    outcome: Option<ShutdownOutcome>,
    disposed: bool,
}

struct ClientInner {
    config: ClientConfig,
    registry: Arc<ControllerRegistry>,
    scopes: Arc<dyn ScopeFactory>,
    token_provider: Option<TokenProvider>,
    /// Serializes concurrent connect attempts (fair FIFO).
    connect_lock: tokio::sync::Mutex<()>,
    state: Mutex<ClientState>,
    /// Aborts an in-flight handshake on shutdown/dispose.
    connect_cancel: Mutex<Option<Arc<Notify>>>,
    on_connected: Mutex<Vec<Box<dyn Fn(&Connection) + Send + Sync>>>,
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    config: ClientConfig,
    registry: ControllerRegistry,
    scopes: Arc<dyn ScopeFactory>,
    token_provider: Option<TokenProvider>,
}

impl RpcClientBuilder {
    /// Controllers this peer exposes for server-initiated calls.
    pub fn registry(mut self, registry: ControllerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Per-request controller scope factory.
    pub fn scope_factory(mut self, scopes: Arc<dyn ScopeFactory>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Auto-authentication: invoked after each successful connect; a
    /// returned token triggers `SignIn` before `connect()` resolves.
    pub fn token_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.token_provider = Some(Box::new(provider));
        self
    }

    /// Build the client.
    pub fn build(self) -> RpcClient {
        RpcClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                registry: Arc::new(self.registry),
                scopes: self.scopes,
                token_provider: self.token_provider,
                connect_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(ClientState::default()),
                connect_cancel: Mutex::new(None),
                on_connected: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// The dialer: holds the server URI and the single connection slot.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Start building a client.
    pub fn builder(config: ClientConfig) -> RpcClientBuilder {
        RpcClientBuilder {
            config,
            registry: ControllerRegistry::new(),
            scopes: Arc::new(NoopScopeFactory),
            token_provider: None,
        }
    }

    /// The currently open connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.inner
            .state
            .lock()
            .connection
            .clone()
            .filter(|c| !c.is_closed())
    }

    /// Subscribe to newly opened connections.
    pub fn on_connected<F>(&self, f: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.inner.on_connected.lock().push(Box::new(f));
    }

    /// Get or establish the connection.
    ///
    /// Safe to call from many tasks: one performs the handshake, the
    /// rest await it and receive the same connection.
    pub async fn connect(&self) -> Result<Connection> {
        // Fast path outside the mutex.
        if let Some(connection) = self.connection() {
            return Ok(connection);
        }

        let _guard = self.inner.connect_lock.lock().await;

        // Another waiter may have connected while we queued.
        if let Some(connection) = self.connection() {
            return Ok(connection);
        }
        {
            let state = self.inner.state.lock();
            if let Some(ticket) = &state.shutdown {
                return Err(SockwireError::WasShutdown {
                    reason: ticket.reason.clone(),
                });
            }
            if state.disposed {
                return Err(SockwireError::Disposed);
            }
        }

        let cancel = Arc::new(Notify::new());
        *self.inner.connect_cancel.lock() = Some(cancel.clone());

        let handshake = tokio::select! {
            _ = cancel.notified() => {
                *self.inner.connect_cancel.lock() = None;
                return Err(self.interrupted_error());
            }
            result = tokio::time::timeout(
                self.inner.config.connect_timeout,
                tokio_tungstenite::connect_async(self.inner.config.url.as_str()),
            ) => result,
        };
        *self.inner.connect_cancel.lock() = None;

        let ws = match handshake {
            Err(_elapsed) => {
                return Err(SockwireError::ConnectFailed(format!(
                    "handshake with {} timed out",
                    self.inner.config.url
                )));
            }
            Ok(Err(e)) => {
                return Err(SockwireError::ConnectFailed(e.to_string()));
            }
            Ok(Ok((ws, _response))) => ws,
        };

        // Best-effort Nagle-off hint for latency-marked actions.
        if self.inner.registry.any_no_delay() {
            if let MaybeTlsStream::Plain(tcp) = ws.get_ref() {
                let _ = tcp.set_nodelay(true);
            }
        }

        let connection = Connection::spawn(
            ws,
            Side::Dialer,
            self.inner.registry.clone(),
            self.inner.scopes.clone(),
            None,
            self.inner.config.connection_options(),
        );

        // Install, unless shutdown won the race.
        let raced_shutdown = {
            let mut state = self.inner.state.lock();
            if let Some(ticket) = &state.shutdown {
                Some(ticket.reason.clone())
            } else if state.disposed {
                Some(String::new())
            } else {
                state.connection = Some(connection.clone());
                None
            }
        };
        if let Some(reason) = raced_shutdown {
            debug!("shutdown raced connect; closing fresh connection");
            let _ = connection.shutdown(Duration::from_secs(1), &reason).await;
            return Err(if reason.is_empty() {
                SockwireError::Disposed
            } else {
                SockwireError::WasShutdown { reason }
            });
        }

        // Clear the slot when this connection dies.
        let weak = Arc::downgrade(&self.inner);
        let this_connection = connection.clone();
        connection.on_disconnected(move |_reason| {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                if let Some(current) = &state.connection {
                    if current.same_as(&this_connection) {
                        state.connection = None;
                    }
                }
            }
        });

        for subscriber in self.inner.on_connected.lock().iter() {
            subscriber(&connection);
        }

        // Auto-authentication: a supplied provider is always invoked;
        // a produced token signs the connection in before we return it.
        if let Some(provider) = &self.inner.token_provider {
            if let Some(token) = provider() {
                if let Err(e) = connection.sign_in(&token).await {
                    warn!(error = %e, "auto sign-in failed");
                }
            }
        }

        Ok(connection)
    }

    fn interrupted_error(&self) -> SockwireError {
        let state = self.inner.state.lock();
        match &state.shutdown {
            Some(ticket) => SockwireError::WasShutdown {
                reason: ticket.reason.clone(),
            },
            None => SockwireError::Disposed,
        }
    }

    async fn obtain(&self) -> Result<Connection> {
        if self.inner.config.auto_connect {
            self.connect().await
        } else {
            self.connection().ok_or(SockwireError::ConnectionNotOpen)
        }
    }

    /// Call a remote action through the connection manager.
    pub async fn call<A, R>(&self, action: &str, args: A) -> Result<R>
    where
        A: ArgsTuple,
        R: DeserializeOwned,
    {
        let connection = self.obtain().await?;
        connection.call(action, args).await
    }

    /// Send a notification through the connection manager.
    pub async fn notify<A: ArgsTuple>(&self, action: &str, args: A) -> Result<()> {
        let connection = self.obtain().await?;
        connection.notify(action, args)
    }

    /// Authenticate the current (or a fresh) connection.
    pub async fn sign_in(&self, token: &[u8]) -> Result<()> {
        let connection = self.obtain().await?;
        connection.sign_in(token).await
    }

    /// Gracefully shut the client down.
    ///
    /// The first call records the shutdown request, aborts any
    /// in-flight handshake, and drains the live connection (if any) up
    /// to `timeout`. Repeat calls await the first shutdown's outcome.
    pub async fn shutdown(&self, timeout: Duration, reason: &str) -> Result<ShutdownOutcome> {
        enum Role {
            First(watch::Sender<bool>, Option<Connection>),
            Waiter(watch::Receiver<bool>),
        }

        let role = {
            let mut state = self.inner.state.lock();
            match &state.shutdown {
                Some(ticket) => Role::Waiter(ticket.done.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    state.shutdown = Some(ShutdownTicket {
                        reason: reason.to_string(),
                        done: rx,
                    });
                    Role::First(tx, state.connection.clone())
                }
            }
        };

        match role {
            Role::Waiter(mut done) => {
                while !*done.borrow() {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
                Ok(self
                    .inner
                    .state
                    .lock()
                    .outcome
                    .clone()
                    .unwrap_or(ShutdownOutcome::NoConnectionGracefully))
            }
            Role::First(done_tx, connection) => {
                if let Some(cancel) = self.inner.connect_cancel.lock().take() {
                    cancel.notify_waiters();
                }

                let outcome = match connection {
                    Some(connection) => {
                        ShutdownOutcome::Connection(connection.shutdown(timeout, reason).await?)
                    }
                    None => ShutdownOutcome::NoConnectionGracefully,
                };

                self.inner.state.lock().outcome = Some(outcome.clone());
                let _ = done_tx.send(true);
                Ok(outcome)
            }
        }
    }

    /// Abrupt teardown: abort any in-flight handshake and dispose the
    /// current connection without draining.
    pub fn dispose(&self) {
        if let Some(cancel) = self.inner.connect_cancel.lock().take() {
            cancel.notify_waiters();
        }
        let connection = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            state.connection.take()
        };
        if let Some(connection) = connection {
            connection.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(url: &str) -> RpcClient {
        RpcClient::builder(ClientConfig::new(url)).build()
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("ws://127.0.0.1:4000");
        assert!(config.auto_connect);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.url, "ws://127.0.0.1:4000");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on this port.
        let client = test_client("ws://127.0.0.1:9");
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, SockwireError::ConnectFailed(_)));
        assert!(client.connection().is_none());
    }

    #[tokio::test]
    async fn test_call_without_connection_when_auto_connect_off() {
        let mut config = ClientConfig::new("ws://127.0.0.1:9");
        config.auto_connect = false;
        let client = RpcClient::builder(config).build();

        let err = client.call::<_, i32>("Math/Sum", (1, 2)).await.unwrap_err();
        assert!(matches!(err, SockwireError::ConnectionNotOpen));
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_fails() {
        let client = test_client("ws://127.0.0.1:9");

        let outcome = client
            .shutdown(Duration::from_secs(1), "done")
            .await
            .unwrap();
        assert_eq!(outcome, ShutdownOutcome::NoConnectionGracefully);

        let err = client.connect().await.unwrap_err();
        match err {
            SockwireError::WasShutdown { reason } => assert_eq!(reason, "done"),
            other => panic!("expected WasShutdown, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repeat_shutdown_same_outcome() {
        let client = test_client("ws://127.0.0.1:9");

        let first = client
            .shutdown(Duration::from_secs(1), "done")
            .await
            .unwrap();
        let second = client
            .shutdown(Duration::from_secs(1), "other")
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_connect_after_dispose_fails() {
        let client = test_client("ws://127.0.0.1:9");
        client.dispose();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, SockwireError::Disposed));
    }
}
