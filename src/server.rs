//! Listener side - accepts sockets and spawns a connection per peer.
//!
//! The server binds a TCP listener, performs the WebSocket handshake
//! per accepted socket, and hands the stream to a [`Connection`] with
//! the shared controller registry, scope factory, and token vault.
//! Everything protocol-level is symmetric with the dialer; only the
//! permission check and the principal live here.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::auth::TokenVault;
use crate::connection::{Connection, ConnectionOptions, Side};
use crate::controller::ControllerRegistry;
use crate::error::Result;
use crate::scope::{NoopScopeFactory, ScopeFactory};

/// Configuration for the listener.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Per-connection tunables (receive timeout, keep-alive, limits).
    pub connection: ConnectionOptions,
}

/// The listener: accepts sockets and runs a connection per peer.
pub struct RpcServer {
    listener: TcpListener,
    registry: Arc<ControllerRegistry>,
    scopes: Arc<dyn ScopeFactory>,
    vault: Option<Arc<dyn TokenVault>>,
    config: ServerConfig,
    on_connected: Mutex<Vec<Box<dyn Fn(&Connection) + Send + Sync>>>,
    on_authenticated: Mutex<Vec<Arc<dyn Fn(&crate::auth::Principal) + Send + Sync>>>,
}

impl RpcServer {
    /// Bind to an address with the given controllers.
    pub async fn bind(addr: &str, registry: ControllerRegistry) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(registry),
            scopes: Arc::new(NoopScopeFactory),
            vault: None,
            config: ServerConfig::default(),
            on_connected: Mutex::new(Vec::new()),
            on_authenticated: Mutex::new(Vec::new()),
        })
    }

    /// Install the token vault enabling `SignIn` on this listener.
    pub fn with_vault(mut self, vault: Arc<dyn TokenVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Replace the per-request scope factory.
    pub fn with_scope_factory(mut self, scopes: Arc<dyn ScopeFactory>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Subscribe to newly accepted connections.
    pub fn on_connected<F>(&self, f: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_connected.lock().push(Box::new(f));
    }

    /// Subscribe to successful sign-ins on any connection.
    pub fn on_authenticated<F>(&self, f: F)
    where
        F: Fn(&crate::auth::Principal) + Send + Sync + 'static,
    {
        self.on_authenticated.lock().push(Arc::new(f));
    }

    /// Accept loop. Runs until the listener fails; typically spawned.
    pub async fn serve(self) -> Result<()> {
        let server = Arc::new(self);
        info!(addr = %server.listener.local_addr()?, "listening");

        loop {
            let (tcp, peer) = server.listener.accept().await?;
            debug!(%peer, "accepted socket");

            if server.registry.any_no_delay() {
                let _ = tcp.set_nodelay(true);
            }

            let server = server.clone();
            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(tcp).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        warn!(%peer, error = %e, "websocket handshake failed");
                        return;
                    }
                };

                let connection = Connection::spawn(
                    ws,
                    Side::Listener,
                    server.registry.clone(),
                    server.scopes.clone(),
                    server.vault.clone(),
                    server.config.connection.clone(),
                );

                for hook in server.on_authenticated.lock().iter() {
                    let hook = hook.clone();
                    connection.on_authenticated(move |principal| hook(principal));
                }
                for subscriber in server.on_connected.lock().iter() {
                    subscriber(&connection);
                }
            });
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("registry", &self.registry)
            .field("has_vault", &self.vault.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtVault;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let server = RpcServer::bind("127.0.0.1:0", ControllerRegistry::new())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_builder_style_configuration() {
        let server = RpcServer::bind("127.0.0.1:0", ControllerRegistry::new())
            .await
            .unwrap()
            .with_vault(Arc::new(JwtVault::new(b"secret")))
            .with_config(ServerConfig::default());
        assert!(server.vault.is_some());
    }
}
