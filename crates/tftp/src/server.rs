//! TFTP Server Implementation
//!
//! The listening socket only routes requests: it validates each RRQ/WRQ,
//! rejects what it cannot serve and spawns one task per accepted transfer,
//! which then talks to the client from its own socket.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::{ErrorKind, Result};
use crate::handler::{FsHandler, RequestHandler};
use crate::incoming::{self, Context};
use crate::names::normalize_filename;
use crate::negotiate::Direction;
use crate::options::{DEFAULT_PORT, GlobalOptions};
use crate::protocol::{MIN_REQUEST_LEN, Packet, TftpOpcode, build_error_kind, get_tftp_opcode};
use crate::registry::Registry;

/// Longest request the listening socket reads
const REQUEST_BUFFER_LEN: usize = 65536;

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub root_directory: PathBuf,
    /// Ceilings and retry budget applied to every transfer
    pub options: GlobalOptions,
    /// Answer every RRQ with `ENOGET`
    pub deny_get: bool,
    /// Answer every WRQ with `ENOPUT`
    pub deny_put: bool,
    /// Local address for transfer sockets
    pub local_bind: Option<IpAddr>,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            root_directory: PathBuf::from("./tftp_root"),
            options: GlobalOptions::default(),
            deny_get: false,
            deny_put: false,
            local_bind: None,
        }
    }
}

/// Stops a running [`TftpServer`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting requests; transfers in progress run to completion
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Resolve once shutdown is requested
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        // The sender lives as long as the server
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Main TFTP server
pub struct TftpServer {
    config: TftpServerConfig,
    socket: UdpSocket,
    handler: Arc<dyn RequestHandler>,
    registry: Registry,
    shutdown: Arc<watch::Sender<bool>>,
}

impl TftpServer {
    /// Bind the listening socket
    ///
    /// Requests are served from `root_directory` until another handler is
    /// installed with [`TftpServer::with_handler`].
    pub async fn bind(mut config: TftpServerConfig) -> Result<Self> {
        config.options = config.options.sanitized();
        let socket = UdpSocket::bind(&config.bind_address).await?;
        let (tx, _) = watch::channel(false);
        Ok(Self {
            handler: Arc::new(FsHandler::new(config.root_directory.clone())),
            config,
            socket,
            registry: Registry::new(),
            shutdown: Arc::new(tx),
        })
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Main server loop
    ///
    /// Returns once shut down and every transfer has finished.
    pub async fn serve(self) -> Result<()> {
        tracing::info!(
            "TFTP server listening on {}, serving files from {}",
            self.local_addr()?,
            self.config.root_directory.display()
        );

        let mut stop = self.shutdown.subscribe();
        let mut transfers = JoinSet::new();
        let mut buffer = vec![0u8; REQUEST_BUFFER_LEN];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, client)) => {
                        tracing::debug!("Received packet from {}", client);
                        self.dispatch(&buffer[..len], client, &mut transfers).await;
                    }
                    Err(e) => tracing::debug!("Receive failed: {}", e),
                },
                _ = stopped(&mut stop) => break,
                Some(joined) = transfers.join_next(), if !transfers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Transfer task failed: {}", e);
                    }
                }
            }
        }

        tracing::info!("TFTP server shutting down, {} transfers in progress", transfers.len());
        while let Some(joined) = transfers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Transfer task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Answer a request that will not be served, from the listening socket
    async fn reject(&self, client: SocketAddr, kind: ErrorKind) {
        tracing::warn!("Rejecting request from {}: {}", client, kind);
        if let Err(e) = self.socket.send_to(&build_error_kind(kind), client).await {
            tracing::debug!("Send to {} failed: {}", client, e);
        }
    }

    /// Validate one request and spawn its transfer
    async fn dispatch(&self, packet: &[u8], client: SocketAddr, transfers: &mut JoinSet<()>) {
        // 2 opcode, at least 1 filename, 4 mode "mail", 2 NUL
        if packet.len() < MIN_REQUEST_LEN {
            return self.reject(client, ErrorKind::BadMsg).await;
        }

        let direction = match get_tftp_opcode(packet) {
            Some(TftpOpcode::ReadRequest) if self.config.deny_get => {
                return self.reject(client, ErrorKind::NoGet).await;
            }
            Some(TftpOpcode::WriteRequest) if self.config.deny_put => {
                return self.reject(client, ErrorKind::NoPut).await;
            }
            Some(TftpOpcode::ReadRequest) => Direction::Get,
            Some(TftpOpcode::WriteRequest) => Direction::Put,
            _ => return self.reject(client, ErrorKind::BadOp).await,
        };

        let request = match Packet::parse(Bytes::copy_from_slice(packet)) {
            Ok(Packet::Rrq(request) | Packet::Wrq(request)) => request,
            Ok(_) => return self.reject(client, ErrorKind::BadOp).await,
            Err(e) => return self.reject(client, e.kind().unwrap_or(ErrorKind::BadMsg)).await,
        };

        let filename = match normalize_filename(&request.filename) {
            Ok(filename) => filename,
            Err(e) => return self.reject(client, e.kind().unwrap_or(ErrorKind::BadName)).await,
        };

        let claim = match self.registry.claim(&filename, direction) {
            Ok(claim) => claim,
            Err(kind) => return self.reject(client, kind).await,
        };

        tracing::info!(
            "{} for '{}' from {} (options: {:?})",
            direction.as_str(),
            filename,
            client,
            request.extensions
        );

        let handler = self.handler.clone();
        let opts = self.config.options.clone();
        let local_bind = self.config.local_bind;
        transfers.spawn(async move {
            let _claim = claim;
            let ctx = Context {
                opts: &opts,
                local_bind,
            };
            match incoming::serve(ctx, handler.as_ref(), direction, filename.clone(), request, client).await {
                Ok(stats) => tracing::info!(
                    "Successfully transferred {} with {} (blksize {}, windowsize {})",
                    filename,
                    client,
                    stats.block_size,
                    stats.window_size
                ),
                Err(e) => tracing::warn!("Failed to transfer '{}' with {}: {}", filename, client, e),
            }
        });
    }
}

/// Run a TFTP server with the given bind address and root directory
///
/// This is a convenience function that creates and runs a TFTP server.
pub async fn run_tftp_server(bind_address: String, root_directory: PathBuf, local_bind: Option<IpAddr>) -> Result<()> {
    let config = TftpServerConfig {
        bind_address,
        root_directory,
        local_bind,
        ..Default::default()
    };
    TftpServer::bind(config).await?.serve().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::protocol::{TransferMode, build_request, parse_error};

    async fn start(config: TftpServerConfig) -> (SocketAddr, ShutdownHandle, tokio::task::JoinHandle<Result<()>>) {
        let server = TftpServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.shutdown_handle();
        (addr, handle, tokio::spawn(server.serve()))
    }

    async fn exchange(server: SocketAddr, packet: &[u8]) -> (SocketAddr, u16, String) {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(packet, server).await.unwrap();
        let mut buf = [0u8; 512];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (code, message) = parse_error(&buf[..n]).unwrap();
        (from, code, message)
    }

    #[test]
    fn test_tftp_server_config_default() {
        let config = TftpServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:69");
        assert_eq!(config.root_directory, PathBuf::from("./tftp_root"));
        assert!(!config.deny_get && !config.deny_put);
    }

    #[tokio::test]
    async fn test_listening_socket_rejections() {
        let temp_dir = tempdir().unwrap();
        let config = TftpServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            root_directory: temp_dir.path().to_path_buf(),
            deny_put: true,
            ..Default::default()
        };
        let (addr, shutdown, task) = start(config).await;

        let (from, code, _) = exchange(addr, &[0, 1, b'a', 0]).await;
        assert_eq!(from, addr);
        assert_eq!(code, 0);

        let wrq = build_request(TftpOpcode::WriteRequest, "file", TransferMode::Octet, None);
        let (from, _, message) = exchange(addr, &wrq).await;
        assert_eq!(from, addr);
        assert_eq!(message, ErrorKind::NoPut.message());

        let (_, code, _) = exchange(addr, &[0, 3, 0, 1, b'x', b'x', b'x', b'x', b'x']).await;
        assert_eq!(code, ErrorKind::BadOp.code());

        let rrq = build_request(TftpOpcode::ReadRequest, "../up", TransferMode::Octet, None);
        let (_, _, message) = exchange(addr, &rrq).await;
        assert_eq!(message, ErrorKind::BadName.message());

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_requested_before_serve() {
        let temp_dir = tempdir().unwrap();
        let config = TftpServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            root_directory: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let server = TftpServer::bind(config).await.unwrap();
        server.shutdown_handle().shutdown();

        let serve = server.serve();
        fn assert_send<T: Send>(_: &T) {}
        assert_send(&serve);
        tokio::time::timeout(Duration::from_secs(5), serve).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_answered_from_transfer_socket() {
        let temp_dir = tempdir().unwrap();
        let config = TftpServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            root_directory: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let (addr, shutdown, task) = start(config).await;

        let rrq = build_request(TftpOpcode::ReadRequest, "missing.bin", TransferMode::Octet, None);
        let (from, code, _) = exchange(addr, &rrq).await;
        assert_ne!(from, addr);
        assert_eq!(code, ErrorKind::NoEnt.code());

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }
}
