//! TFTP client
//!
//! [`Client`] runs GET and PUT transfers against one server. Every request
//! proposes the configured options; a server that ignores them, or rejects
//! them with error 8, is talked to as a plain RFC 1350 peer.

use std::io;
use std::net::SocketAddr;
use std::path::Path;

use crate::abort::AbortSignal;
use crate::error::{Error, ErrorKind, Result};
use crate::names::normalize_filename;
use crate::negotiate::{Addrs, Direction, accept_oack, fits_unextended};
use crate::options::{Extensions, GlobalOptions, NegotiatedStats, RFC_BLOCK_SIZE, UserExtensions};
use crate::protocol::{Packet, TftpOpcode, TransferMode, build_request};
use crate::reader::Reader;
use crate::stream::{Checksum, DigestSink, Sink, Source};
use crate::transport::{self, Connection, Driver, Endpoints, Transport, bind_ephemeral};
use crate::writer::Writer;

/// Per-GET settings
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Sent in addition to the client's global user extensions
    pub user_extensions: UserExtensions,
    /// Expected md5 of the content, as hex
    pub md5: Option<String>,
    /// Expected sha1 of the content, as hex; checked instead of md5
    pub sha1: Option<String>,
    pub abort: Option<AbortSignal>,
}

impl GetOptions {
    fn checksum(&self) -> Option<Checksum> {
        self.sha1
            .clone()
            .map(Checksum::Sha1)
            .or_else(|| self.md5.clone().map(Checksum::Md5))
    }
}

/// Per-PUT settings
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Exact number of bytes the source yields
    pub size: u64,
    pub user_extensions: UserExtensions,
    pub abort: Option<AbortSignal>,
}

impl PutOptions {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
enum Phase {
    Requesting { extended: bool, fallback_done: bool },
    Reading(Reader),
    Writing(Writer),
}

/// Client side of the request/negotiation exchange
#[derive(Debug)]
struct RequestDriver<'o> {
    direction: Direction,
    filename: String,
    opts: &'o GlobalOptions,
    requested: Extensions,
    /// Size of a PUT
    size: Option<u64>,
    phase: Phase,
    stats: Option<NegotiatedStats>,
}

impl<'o> RequestDriver<'o> {
    fn new(
        direction: Direction,
        filename: String,
        opts: &'o GlobalOptions,
        requested: Extensions,
        size: Option<u64>,
    ) -> Self {
        Self {
            direction,
            filename,
            opts,
            requested,
            size,
            phase: Phase::Requesting {
                extended: true,
                fallback_done: false,
            },
            stats: None,
        }
    }

    fn opcode(&self) -> TftpOpcode {
        match self.direction {
            Direction::Get => TftpOpcode::ReadRequest,
            Direction::Put => TftpOpcode::WriteRequest,
        }
    }

    fn send_request(&self, conn: &mut Connection, extended: bool) {
        let extensions = extended.then_some(&self.requested);
        let buf = build_request(self.opcode(), &self.filename, TransferMode::Octet, extensions);
        conn.send_pending(buf);
    }

    fn addrs(conn: &Connection) -> Addrs {
        Addrs {
            local: conn.local_addr(),
            remote: conn.remote_addr(),
        }
    }

    /// Negotiation is over; hand the transfer to a window engine
    fn begin(&mut self, conn: &mut Connection, stats: NegotiatedStats) {
        tracing::debug!(
            "Negotiated blksize={} windowsize={} tsize={:?} rollover={} with {}",
            stats.block_size,
            stats.window_size,
            stats.transfer_size,
            stats.rollover,
            stats.remote_addr
        );
        conn.clear_pending();
        conn.set_timeout(stats.timeout);
        self.phase = match self.direction {
            Direction::Get => {
                conn.declare_size(stats.transfer_size);
                Phase::Reading(Reader::new(&stats))
            }
            Direction::Put => Phase::Writing(Writer::new(&stats, self.size)),
        };
        self.stats = Some(stats);
    }

    fn on_request_reply(&mut self, conn: &mut Connection, packet: Packet, extended: bool, fallback_done: bool) {
        match (self.direction, packet) {
            (Direction::Get, Packet::Data { block, data }) => {
                if data.len() > RFC_BLOCK_SIZE {
                    conn.fail(ErrorKind::BadMsg);
                    return;
                }
                self.begin(conn, NegotiatedStats::rfc_defaults(self.opts, conn.local_addr(), conn.remote_addr()));
                if let Phase::Reading(reader) = &mut self.phase {
                    reader.on_data(block, data, conn);
                }
            }
            (Direction::Put, Packet::Ack(0)) => {
                if !fits_unextended(self.size) {
                    conn.reject(ErrorKind::Deny, ErrorKind::FBig);
                    return;
                }
                let mut stats = NegotiatedStats::rfc_defaults(self.opts, conn.local_addr(), conn.remote_addr());
                stats.transfer_size = self.size;
                self.begin(conn, stats);
                if let Phase::Writing(writer) = &mut self.phase {
                    writer.pump(conn);
                }
            }
            (Direction::Put, Packet::Ack(_)) => conn.fail(ErrorKind::BadMsg),
            (_, Packet::Oack(oack)) if extended => {
                match accept_oack(&oack, &self.requested, self.opts, self.size, Self::addrs(conn)) {
                    Ok(stats) => {
                        self.begin(conn, stats);
                        match &mut self.phase {
                            Phase::Reading(_) => {
                                conn.send_ack(0);
                                conn.arm_timer();
                            }
                            Phase::Writing(writer) => writer.pump(conn),
                            Phase::Requesting { .. } => {}
                        }
                    }
                    Err(ErrorKind::FBig) => conn.reject(ErrorKind::Deny, ErrorKind::FBig),
                    Err(kind) => conn.fail(kind),
                }
            }
            (_, Packet::Error { code: 8, .. }) if extended && !fallback_done => {
                tracing::debug!("Server denied the options, retrying {} without them", self.filename);
                self.phase = Phase::Requesting {
                    extended: false,
                    fallback_done: true,
                };
                conn.unlock_peer();
                self.send_request(conn, false);
            }
            // Code 8 only answers requests that carry options
            (_, Packet::Error { code: 8, .. }) => conn.fail(ErrorKind::BadOp),
            (_, Packet::Error { code, message }) => conn.close(Err(Error::Remote { code, message })),
            _ => conn.fail(ErrorKind::BadOp),
        }
    }
}

impl Driver for RequestDriver<'_> {
    fn on_packet(&mut self, conn: &mut Connection, packet: Packet) {
        match &mut self.phase {
            Phase::Requesting { extended, fallback_done } => {
                let (extended, fallback_done) = (*extended, *fallback_done);
                self.on_request_reply(conn, packet, extended, fallback_done);
            }
            Phase::Reading(reader) => match packet {
                Packet::Data { block, data } => reader.on_data(block, data, conn),
                // The server did not see our ACK of its OACK
                Packet::Oack(_) if !reader.has_data() => {
                    conn.send_ack(0);
                    conn.arm_timer();
                }
                Packet::Error { code, message } => conn.close(Err(Error::Remote { code, message })),
                _ => conn.fail(ErrorKind::BadOp),
            },
            Phase::Writing(writer) => match packet {
                Packet::Ack(block) => writer.on_ack(block, conn),
                Packet::Oack(_) => writer.on_timeout(conn),
                Packet::Error { code, message } => conn.close(Err(Error::Remote { code, message })),
                _ => conn.fail(ErrorKind::BadOp),
            },
        }
    }

    fn on_timeout(&mut self, conn: &mut Connection) {
        match &mut self.phase {
            Phase::Requesting { .. } => conn.resend_pending(),
            Phase::Reading(reader) => reader.on_timeout(conn),
            Phase::Writing(writer) => writer.on_timeout(conn),
        }
    }

    fn writer(&mut self) -> Option<&mut Writer> {
        match &mut self.phase {
            Phase::Writing(writer) => Some(writer),
            _ => None,
        }
    }
}

/// GET/PUT front-end bound to one server
#[derive(Debug, Clone)]
pub struct Client {
    opts: GlobalOptions,
}

impl Client {
    pub fn new(opts: GlobalOptions) -> Self {
        Self {
            opts: opts.sanitized(),
        }
    }

    pub fn options(&self) -> &GlobalOptions {
        &self.opts
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.opts.address.as_str(), self.opts.port))
            .await?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", self.opts.address)).into()
            })
    }

    async fn connect(&self) -> Result<Connection> {
        let target = self.resolve().await?;
        let socket = bind_ephemeral(target, None).await?;
        Ok(Connection::new(socket, target, self.opts.retries, self.opts.timeout)?)
    }

    /// Download `remote` into `sink`
    pub async fn get(&self, remote: &str, sink: &mut (dyn Sink + '_), options: GetOptions) -> Result<NegotiatedStats> {
        let filename = normalize_filename(remote)?;
        let mut conn = self.connect().await?;
        let requested = self.opts.request_extensions(0, &options.user_extensions);
        let mut driver = RequestDriver::new(Direction::Get, filename, &self.opts, requested, None);

        tracing::info!("GET {} from {}", driver.filename, conn.remote_addr());
        driver.send_request(&mut conn, true);

        let checksum = options.checksum();
        let abort = options.abort;
        match checksum {
            Some(checksum) => {
                let mut digest = DigestSink::new(sink, checksum);
                let ends = Endpoints {
                    source: None,
                    sink: Some(&mut digest),
                    abort,
                };
                transport::run(&mut conn, &mut driver, ends).await?;
                if let Err(err) = digest.verify() {
                    digest.abort(&err).await;
                    return Err(err);
                }
            }
            None => {
                let ends = Endpoints {
                    source: None,
                    sink: Some(sink),
                    abort,
                };
                transport::run(&mut conn, &mut driver, ends).await?;
            }
        }

        tracing::info!("GET {} complete", driver.filename);
        driver.stats.ok_or_else(|| ErrorKind::BadOp.into())
    }

    /// Upload `options.size` bytes from `source` as `remote`
    pub async fn put(
        &self,
        remote: &str,
        source: &mut (dyn Source + '_),
        options: PutOptions,
    ) -> Result<NegotiatedStats> {
        let filename = normalize_filename(remote)?;
        let mut conn = self.connect().await?;
        let requested = self.opts.request_extensions(options.size, &options.user_extensions);
        let mut driver = RequestDriver::new(Direction::Put, filename, &self.opts, requested, Some(options.size));

        tracing::info!("PUT {} ({} bytes) to {}", driver.filename, options.size, conn.remote_addr());
        driver.send_request(&mut conn, true);

        let ends = Endpoints {
            source: Some(source),
            sink: None,
            abort: options.abort,
        };
        transport::run(&mut conn, &mut driver, ends).await?;

        tracing::info!("PUT {} complete", driver.filename);
        driver.stats.ok_or_else(|| ErrorKind::BadOp.into())
    }

    /// Download `remote` into a new local file
    ///
    /// The file is removed again if the transfer fails.
    pub async fn get_file(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
        options: GetOptions,
    ) -> Result<NegotiatedStats> {
        let path = local.as_ref();
        if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
            return Err(ErrorKind::IsDir.into());
        }

        let mut file = tokio::fs::File::create(path).await?;
        let result = self.get(remote, &mut file, options).await;
        drop(file);

        if result.is_err()
            && let Err(e) = tokio::fs::remove_file(path).await
        {
            tracing::debug!("Failed to remove {}: {}", path.display(), e);
        }
        result
    }

    /// Upload a local file
    pub async fn put_file(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        mut options: PutOptions,
    ) -> Result<NegotiatedStats> {
        let path = local.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if meta.is_dir() {
            return Err(ErrorKind::IsDir.into());
        }

        options.size = meta.len();
        let mut file = tokio::fs::File::open(path).await?;
        self.put(remote, &mut file, options).await
    }
}
