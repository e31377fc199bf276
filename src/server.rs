//! Connection lifecycle manager.
//!
//! Owns the listening socket, spawns one tracked task per accepted
//! connection, and drains in-flight connections on shutdown. One
//! connection's failure never affects the listener or its siblings.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{ProxyError, ServerError};
use crate::proxy::{self, ProxyContext};

pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    listen_addr: String,
}

impl ProxyServer {
    pub fn new(ctx: Arc<ProxyContext>, listen_addr: impl Into<String>) -> Self {
        Self { ctx, listen_addr: listen_addr.into() }
    }

    /// Binds the listening socket. Split from [`BoundProxyServer::serve`] so
    /// callers can learn the bound address before serving.
    pub async fn bind(self) -> Result<BoundProxyServer, ServerError> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ServerError::BindFailed { address: self.listen_addr.clone(), source })?;
        info!(addr = %self.listen_addr, "listening");
        Ok(BoundProxyServer { ctx: self.ctx, listener })
    }
}

pub struct BoundProxyServer {
    ctx: Arc<ProxyContext>,
    listener: TcpListener,
}

impl BoundProxyServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` fires, then closes the listener
    /// and waits for every in-flight connection to reach a terminal state.
    /// Live relays are drained, not killed.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(peer = %peer, "client connected");
                            let ctx = self.ctx.clone();
                            connections.spawn(async move {
                                match proxy::handle(stream, &ctx).await {
                                    Ok(()) => info!(peer = %peer, "session ended"),
                                    Err(err) => log_terminal(&peer, &err),
                                }
                            });
                        }
                        Err(err) => {
                            // Transient accept errors must not take the
                            // listener down.
                            warn!(error = %err, "accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested; closing listener");
                    break;
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = %err, "connection task aborted");
                    }
                }
            }
        }

        drop(self.listener);
        let in_flight = connections.len();
        if in_flight > 0 {
            info!(in_flight, "draining connections");
        }
        while let Some(finished) = connections.join_next().await {
            if let Err(err) = finished {
                warn!(error = %err, "connection task aborted");
            }
        }
        info!("all connections drained");
        Ok(())
    }
}

fn log_terminal(peer: &SocketAddr, err: &ProxyError) {
    match err {
        // A relay fault is usually just the peer disconnecting uncleanly;
        // keep it quiet relative to setup failures.
        ProxyError::Relay(reason) => info!(peer = %peer, reason = %reason, "session ended"),
        other => warn!(peer = %peer, error = %other, "connection failed"),
    }
}
