// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minion-side client for connecting to the faultline coordinator.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::frame::{FrameError, FramedStream};
use crate::message::{Command, ControlMessage};
use crate::server::DEFAULT_PORT;

/// Errors that can occur in the minion client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("unexpected command from coordinator: {0}")]
    UnexpectedCommand(i32),
}

/// Configuration for the minion client
#[derive(Debug, Clone)]
pub struct MinionClientConfig {
    /// Coordinator address to connect to
    pub server_addr: SocketAddr,
    /// Timeout for a single connection attempt in milliseconds
    pub connect_timeout_ms: u64,
    /// Additional attempts after the first failed connect
    pub connect_retries: u32,
    /// Upper bound of the random pause between attempts in milliseconds
    pub retry_backoff_ms: u64,
}

impl Default for MinionClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            connect_timeout_ms: 10_000,
            connect_retries: 5,
            retry_backoff_ms: 1_000,
        }
    }
}

/// What the coordinator answered to a work request
#[derive(Debug, Clone, PartialEq)]
pub enum WorkAssignment {
    /// A job to execute
    Work { workload_id: u32, payload: Bytes },
    /// Campaign exhausted; disconnect
    Die,
}

/// One persistent connection from a minion to the coordinator
pub struct MinionClient<S = TcpStream> {
    stream: FramedStream<S>,
}

impl MinionClient<TcpStream> {
    /// Connect to the coordinator, retrying with a randomized pause so a
    /// fleet of minions started together does not reconnect in lockstep.
    #[instrument(skip(config), fields(addr = %config.server_addr))]
    pub async fn connect(config: &MinionClientConfig) -> Result<Self, ClientError> {
        let mut attempt = 0;
        loop {
            match Self::try_connect(config).await {
                Ok(stream) => {
                    info!(attempt, "connected to coordinator");
                    return Ok(Self::new(stream));
                }
                Err(e) if attempt < config.connect_retries => {
                    attempt += 1;
                    let pause = rand::thread_rng().gen_range(0..=config.retry_backoff_ms);
                    warn!(attempt, pause_ms = pause, error = %e, "connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_connect(config: &MinionClientConfig) -> Result<TcpStream, ClientError> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(config.server_addr))
            .await
            .map_err(|_| ClientError::Timeout(config.connect_timeout_ms))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> MinionClient<S> {
    /// Wrap an already connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: FramedStream::new(stream),
        }
    }

    /// Send NEED_WORK and wait for the coordinator's answer
    pub async fn request_work(&mut self, build_id: u64) -> Result<WorkAssignment, ClientError> {
        self.stream.send(&ControlMessage::need_work(build_id)).await?;

        let reply: ControlMessage = self.stream.recv().await?;
        match reply.command() {
            Command::WorkFollows => {
                let payload = self.stream.recv_raw().await?;
                debug!(workload_id = reply.workload_id, size = payload.len(), "received work");
                Ok(WorkAssignment::Work {
                    workload_id: reply.workload_id,
                    payload,
                })
            }
            Command::Die => Ok(WorkAssignment::Die),
            _ => Err(ClientError::UnexpectedCommand(reply.command)),
        }
    }

    /// Send RESULT_FOLLOWS followed by the result payload
    pub async fn send_result(
        &mut self,
        build_id: u64,
        workload_id: u32,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        self.stream
            .send(&ControlMessage::result_follows(build_id, workload_id))
            .await?;
        self.stream.send_raw(payload).await?;
        Ok(())
    }

    /// Access the underlying framed stream
    pub fn framed(&mut self) -> &mut FramedStream<S> {
        &mut self.stream
    }

    /// Close the write half of the connection
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
