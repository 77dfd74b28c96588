//! TFTP client and server engine
//!
//! A TFTP (RFC 1350) implementation over tokio with the option extensions
//! most deployments rely on:
//!
//! - Option negotiation (RFC 2347)
//! - Block size (RFC 2348) and transfer size / timeout (RFC 2349)
//! - Windowed transfers (`windowsize`, RFC 7440) with one cumulative ACK per window
//! - Block counter `rollover` past 65535
//! - Opaque user extensions carried end to end
//!
//! Every transfer owns one UDP socket and runs as one task. The window
//! engines ([`Reader`], [`Writer`]) are plain state machines driven through
//! the [`Transport`] trait, so they can be exercised without a network.
//!
//! # Client Usage
//!
//! ```rust,no_run
//! use tftp::{Client, GetOptions, GlobalOptions, PutOptions};
//!
//! #[tokio::main]
//! async fn main() -> tftp::Result<()> {
//!     let client = Client::new(GlobalOptions::new("192.168.1.10").with_window_size(8));
//!
//!     let stats = client.get_file("pxelinux.0", "/tmp/pxelinux.0", GetOptions::default()).await?;
//!     println!("blksize {}, windowsize {}", stats.block_size, stats.window_size);
//!
//!     client.put_file("/tmp/report.txt", "report.txt", PutOptions::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Server Usage
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use tftp::{TftpServer, TftpServerConfig, run_tftp_server};
//!
//! #[tokio::main]
//! async fn main() -> tftp::Result<()> {
//!     // Simple usage with convenience function
//!     run_tftp_server("0.0.0.0:69".to_string(), PathBuf::from("./tftp_root"), None).await?;
//!
//!     // Or use the server struct for more control
//!     let config = TftpServerConfig {
//!         bind_address: "127.0.0.1:6969".to_string(),
//!         root_directory: PathBuf::from("./files"),
//!         deny_put: true,
//!         ..Default::default()
//!     };
//!     let server = TftpServer::bind(config).await?;
//!     let shutdown = server.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!     server.serve().await
//! }
//! ```

mod abort;
mod client;
mod error;
mod handler;
mod incoming;
mod names;
mod negotiate;
mod options;
mod protocol;
mod reader;
mod registry;
mod retransmitter;
mod server;
mod stream;
mod transport;
pub mod window;
mod writer;

pub use abort::{AbortHandle, AbortSignal, abort_pair};
pub use client::{Client, GetOptions, PutOptions};
pub use error::{Error, ErrorKind, Result};
pub use handler::{FsHandler, GetResponse, IncomingRequest, PutResponse, RequestHandler};
pub use names::normalize_filename;
pub use negotiate::{Addrs, Direction, Offer, accept_oack, fits_unextended, offer};
pub use options::*;
pub use protocol::*;
pub use reader::Reader;
pub use retransmitter::{Expiry, Retransmitter};
pub use server::{ShutdownHandle, TftpServer, TftpServerConfig, run_tftp_server};
pub use stream::{Checksum, DigestSink, Sink, Source};
pub use transport::{State, Transport};
pub use window::Window;
pub use writer::Writer;
