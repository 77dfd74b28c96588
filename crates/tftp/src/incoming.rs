//! Server side of one transfer
//!
//! Runs after the listening socket has accepted a request: binds the
//! transfer socket, asks the [`RequestHandler`] for the local end, answers
//! with an OACK (or block 0 / ACK 0 for plain RFC 1350 clients) and hands
//! over to a window engine.

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, ErrorKind, Result};
use crate::handler::{IncomingRequest, RequestHandler};
use crate::negotiate::{Addrs, Direction, fits_unextended, offer};
use crate::options::{GlobalOptions, NegotiatedStats};
use crate::protocol::{Packet, Request, build_oack};
use crate::reader::Reader;
use crate::stream::Source;
use crate::transport::{self, Connection, Driver, Endpoints, Transport, bind_ephemeral};
use crate::writer::Writer;

#[derive(Debug)]
enum Phase {
    /// OACK sent; waiting for ACK 0 (GET) or DATA 1 (PUT)
    OackSent,
    Reading(Reader),
    Writing(Writer),
}

#[derive(Debug)]
struct IncomingDriver {
    direction: Direction,
    stats: NegotiatedStats,
    phase: Phase,
}

impl IncomingDriver {
    fn on_oack_reply(&mut self, conn: &mut Connection, packet: Packet) {
        match (self.direction, packet) {
            (Direction::Get, Packet::Ack(0)) => {
                conn.clear_pending();
                let mut writer = Writer::new(&self.stats, self.stats.transfer_size);
                writer.pump(conn);
                self.phase = Phase::Writing(writer);
            }
            (Direction::Get, Packet::Ack(_)) => conn.fail(ErrorKind::BadMsg),
            // The first block doubles as the acknowledgment of the OACK
            (Direction::Put, Packet::Data { block, data }) => {
                conn.clear_pending();
                let mut reader = Reader::new(&self.stats);
                reader.on_data(block, data, conn);
                self.phase = Phase::Reading(reader);
            }
            (_, Packet::Error { code, message }) => conn.close(Err(Error::Remote { code, message })),
            _ => conn.fail(ErrorKind::BadOp),
        }
    }
}

impl Driver for IncomingDriver {
    fn on_packet(&mut self, conn: &mut Connection, packet: Packet) {
        match &mut self.phase {
            Phase::OackSent => self.on_oack_reply(conn, packet),
            Phase::Reading(reader) => match packet {
                Packet::Data { block, data } => reader.on_data(block, data, conn),
                Packet::Error { code, message } => conn.close(Err(Error::Remote { code, message })),
                _ => conn.fail(ErrorKind::BadOp),
            },
            Phase::Writing(writer) => match packet {
                Packet::Ack(block) => writer.on_ack(block, conn),
                Packet::Error { code, message } => conn.close(Err(Error::Remote { code, message })),
                _ => conn.fail(ErrorKind::BadOp),
            },
        }
    }

    fn on_timeout(&mut self, conn: &mut Connection) {
        match &mut self.phase {
            Phase::OackSent => conn.resend_pending(),
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

/// Settings of the server that accepted the request
#[derive(Debug, Clone)]
pub(crate) struct Context<'a> {
    pub opts: &'a GlobalOptions,
    pub local_bind: Option<IpAddr>,
}

/// Run one accepted request to completion
///
/// `filename` is the normalized name from `request`. Errors are reported
/// to the client from the transfer socket before being returned.
pub(crate) async fn serve(
    ctx: Context<'_>,
    handler: &dyn RequestHandler,
    direction: Direction,
    filename: String,
    request: Request,
    peer: SocketAddr,
) -> Result<NegotiatedStats> {
    let socket = bind_ephemeral(peer, ctx.local_bind).await?;
    let mut conn = Connection::locked(socket, peer, ctx.opts.retries, ctx.opts.timeout)?;
    let addrs = Addrs {
        local: conn.local_addr(),
        remote: peer,
    };

    let extensions = request.extensions;
    let incoming = IncomingRequest {
        filename,
        direction,
        size: match direction {
            Direction::Get => None,
            Direction::Put => extensions.as_ref().and_then(|ext| ext.tsize),
        },
        user_extensions: extensions.as_ref().map(|ext| ext.user.clone()).unwrap_or_default(),
        peer,
    };

    match direction {
        Direction::Get => {
            let mut resp = match handler.open_get(&incoming).await {
                Ok(resp) => resp,
                Err(err) => return Err(refuse(&mut conn, &incoming, err, None).await),
            };
            let negotiated = extensions
                .as_ref()
                .map(|ext| offer(ext, ctx.opts, direction, resp.size, &resp.user_extensions, addrs))
                .filter(|o| !o.reply.is_empty());

            let driver = match negotiated {
                Some(offer) => {
                    if offer.reply.blksize.is_none() && !fits_unextended(resp.size) {
                        let err = refuse(&mut conn, &incoming, ErrorKind::FBig.into(), Some(ErrorKind::Deny)).await;
                        resp.source.abort(&err).await;
                        return Err(err);
                    }
                    conn.set_timeout(offer.stats.timeout);
                    conn.send_pending(build_oack(&offer.reply));
                    IncomingDriver {
                        direction,
                        stats: offer.stats,
                        phase: Phase::OackSent,
                    }
                }
                None => {
                    if !fits_unextended(resp.size) {
                        let err = refuse(&mut conn, &incoming, ErrorKind::FBig.into(), Some(ErrorKind::Deny)).await;
                        resp.source.abort(&err).await;
                        return Err(err);
                    }
                    let mut stats = NegotiatedStats::rfc_defaults(ctx.opts, addrs.local, addrs.remote);
                    stats.transfer_size = resp.size;
                    let mut writer = Writer::new(&stats, resp.size);
                    writer.pump(&mut conn);
                    IncomingDriver {
                        direction,
                        stats,
                        phase: Phase::Writing(writer),
                    }
                }
            };

            let ends = Endpoints {
                source: Some(&mut *resp.source),
                sink: None,
                abort: None,
            };
            drive(conn, driver, ends, &incoming).await
        }
        Direction::Put => {
            let mut resp = match handler.open_put(&incoming).await {
                Ok(resp) => resp,
                Err(err) => return Err(refuse(&mut conn, &incoming, err, None).await),
            };
            let negotiated = extensions
                .as_ref()
                .map(|ext| offer(ext, ctx.opts, direction, None, &resp.user_extensions, addrs))
                .filter(|o| !o.reply.is_empty());

            let driver = match negotiated {
                Some(offer) => {
                    conn.declare_size(offer.stats.transfer_size);
                    conn.set_timeout(offer.stats.timeout);
                    conn.send_pending(build_oack(&offer.reply));
                    IncomingDriver {
                        direction,
                        stats: offer.stats,
                        phase: Phase::OackSent,
                    }
                }
                None => {
                    let stats = NegotiatedStats::rfc_defaults(ctx.opts, addrs.local, addrs.remote);
                    conn.declare_size(None);
                    // The reader repeats ACK 0 until the first block shows up
                    conn.send_ack(0);
                    conn.arm_timer();
                    IncomingDriver {
                        direction,
                        phase: Phase::Reading(Reader::new(&stats)),
                        stats,
                    }
                }
            };

            let ends = Endpoints {
                source: None,
                sink: Some(&mut *resp.sink),
                abort: None,
            };
            drive(conn, driver, ends, &incoming).await
        }
    }
}

async fn drive(
    mut conn: Connection,
    mut driver: IncomingDriver,
    ends: Endpoints<'_>,
    incoming: &IncomingRequest,
) -> Result<NegotiatedStats> {
    tracing::debug!(
        "{} {} with {}: blksize={} windowsize={} tsize={:?}",
        incoming.direction.as_str(),
        incoming.filename,
        incoming.peer,
        driver.stats.block_size,
        driver.stats.window_size,
        driver.stats.transfer_size
    );
    transport::run(&mut conn, &mut driver, ends).await?;
    Ok(driver.stats)
}

/// Tell the client why the request ends before any transfer
///
/// The client sees `sent` if given, otherwise the mirror of `err`.
async fn refuse(conn: &mut Connection, incoming: &IncomingRequest, err: Error, sent: Option<ErrorKind>) -> Error {
    tracing::debug!("Refusing {} {}: {}", incoming.direction.as_str(), incoming.filename, err);
    match sent {
        Some(kind) => conn.notify(&kind.into()),
        None => conn.notify(&err),
    }
    conn.transmit().await;
    err
}
