// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP server helpers for the faultline coordinator.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, instrument, warn};

use crate::frame::{FrameError, FramedStream};

/// Default coordinator port
pub const DEFAULT_PORT: u16 = 1111;

/// Errors that can occur in the TCP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[source] std::io::Error),

    #[error("accept error: {0}")]
    Accept(#[source] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Configuration for the TCP server
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Listen backlog passed to `listen(2)`
    pub backlog: u32,
    /// Maximum concurrent minion sessions (0 for unlimited)
    pub max_concurrent_sessions: u32,
    /// Disable Nagle's algorithm on accepted connections
    pub nodelay: bool,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            backlog: 1024,
            max_concurrent_sessions: 0, // unlimited by default
            nodelay: true,
        }
    }
}

impl TcpServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `FAULTLINE_BACKLOG`: Listen backlog (default: 1024)
    /// - `FAULTLINE_MAX_SESSIONS`: Max concurrent minion sessions, 0 for unlimited (default: 0)
    /// - `FAULTLINE_TCP_NODELAY`: Set TCP_NODELAY on accepted sockets (default: true)
    ///
    /// The bind address is owned by the coordinator configuration.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            bind_addr: default.bind_addr,
            backlog: std::env::var("FAULTLINE_BACKLOG")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.backlog),
            max_concurrent_sessions: std::env::var("FAULTLINE_MAX_SESSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_concurrent_sessions),
            nodelay: std::env::var("FAULTLINE_TCP_NODELAY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.nodelay),
        }
    }
}

/// Length-prefixed TCP server
pub struct FramedServer {
    listener: TcpListener,
    config: TcpServerConfig,
}

impl FramedServer {
    /// Bind a listener with the given configuration.
    ///
    /// The socket is built with `SO_REUSEADDR` so a restarted coordinator can
    /// rebind while old connections sit in TIME_WAIT.
    pub fn bind(config: TcpServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket =
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(ServerError::Bind)?;
        socket.set_reuse_address(true).map_err(ServerError::Bind)?;
        socket.set_nonblocking(true).map_err(ServerError::Bind)?;
        socket
            .bind(&config.bind_addr.into())
            .map_err(ServerError::Bind)?;
        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(ServerError::Bind)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener).map_err(ServerError::Bind)?;

        info!(
            addr = %config.bind_addr,
            backlog = config.backlog,
            max_sessions = config.max_concurrent_sessions,
            "TCP server bound"
        );

        Ok(Self { listener, config })
    }

    /// Get the server configuration
    pub fn config(&self) -> &TcpServerConfig {
        &self.config
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Bind)
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> Result<(FramedStream<TcpStream>, SocketAddr), ServerError> {
        let (stream, peer) = self.listener.accept().await.map_err(ServerError::Accept)?;
        if self.config.nodelay
            && let Err(e) = stream.set_nodelay(true)
        {
            warn!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok((FramedStream::new(stream), peer))
    }

    /// Accept connections and hand each one to `handler` on its own task
    /// until `shutdown` flips to `true`.
    ///
    /// Handlers already running are left to finish on their own.
    #[instrument(skip(self, handler, shutdown))]
    pub async fn run_until<H, Fut>(
        &self,
        handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError>
    where
        H: Fn(FramedStream<TcpStream>, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("TCP server running");

        // Create semaphore for backpressure if configured
        let semaphore = if self.config.max_concurrent_sessions > 0 {
            Some(Arc::new(Semaphore::new(
                self.config.max_concurrent_sessions as usize,
            )))
        } else {
            None
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    debug!(%peer, "accepted connection");

                    let handler = handler.clone();
                    let semaphore = semaphore.clone();
                    tokio::spawn(async move {
                        // Acquire permit if semaphore is configured
                        let _permit = if let Some(ref sem) = semaphore {
                            match sem.clone().acquire_owned().await {
                                Ok(permit) => Some(permit),
                                Err(_) => {
                                    warn!("semaphore closed, dropping connection");
                                    return;
                                }
                            }
                        } else {
                            None
                        };

                        handler(stream, peer).await;
                    });
                }
            }
        }

        info!("TCP server stopped accepting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, ControlMessage};
    use std::time::Duration;

    fn loopback_config() -> TcpServerConfig {
        TcpServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = TcpServerConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.backlog, 1024);
        assert_eq!(config.max_concurrent_sessions, 0);
        assert!(config.nodelay);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = FramedServer::bind(loopback_config()).unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_bind_error() {
        let first = FramedServer::bind(loopback_config()).unwrap();
        let taken = first.local_addr().unwrap();

        let result = FramedServer::bind(TcpServerConfig {
            bind_addr: taken,
            ..Default::default()
        });
        assert!(matches!(result, Err(ServerError::Bind(_))));
    }

    #[tokio::test]
    async fn test_run_until_dispatches_connections() {
        let server = FramedServer::bind(loopback_config()).unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server_task = tokio::spawn(async move {
            server
                .run_until(
                    |mut stream: FramedStream<TcpStream>, _peer| async move {
                        let msg: ControlMessage = stream.recv().await.unwrap();
                        stream.send(&ControlMessage::die(msg.build_id)).await.unwrap();
                    },
                    shutdown_rx,
                )
                .await
        });

        let mut client = FramedStream::new(TcpStream::connect(addr).await.unwrap());
        client.send(&ControlMessage::need_work(5)).await.unwrap();
        let reply: ControlMessage = client.recv().await.unwrap();
        assert_eq!(reply.command(), Command::Die);
        assert_eq!(reply.build_id, 5);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_until_returns_when_already_shut_down() {
        let server = FramedServer::bind(loopback_config()).unwrap();
        let (_tx, rx) = watch::channel(true);

        tokio::time::timeout(
            Duration::from_secs(5),
            server.run_until(|_stream, _peer| async {}, rx),
        )
        .await
        .expect("server did not stop")
        .unwrap();
    }
}
