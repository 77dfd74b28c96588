//! Option negotiation
//!
//! The client side checks an OACK against what was asked for and the local
//! ceilings; the server side turns a request's options into the OACK it
//! answers with. Both produce the [`NegotiatedStats`] the transfer runs on.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::options::{
    Extensions, GlobalOptions, MAX_UNEXTENDED_SIZE, MIN_BLOCK_SIZE, NegotiatedStats, RFC_BLOCK_SIZE, UserExtensions,
};

/// Direction of a transfer, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Read from the server (RRQ)
    Get,
    /// Write to the server (WRQ)
    Put,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

/// Socket addresses of the transfer being negotiated
#[derive(Debug, Clone, Copy)]
pub struct Addrs {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Whether a transfer of `size` bytes fits without the blksize option
pub fn fits_unextended(size: Option<u64>) -> bool {
    size.is_none_or(|size| size <= MAX_UNEXTENDED_SIZE)
}

/// Validate an OACK received by the client
///
/// `requested` is what went out in the request and `size` the local size
/// of a PUT. Any value outside what was asked for fails with `EDENY`; a
/// large PUT the server accepted without a block size fails with `EFBIG`.
pub fn accept_oack(
    oack: &Extensions,
    requested: &Extensions,
    opts: &GlobalOptions,
    size: Option<u64>,
    addrs: Addrs,
) -> Result<NegotiatedStats, ErrorKind> {
    if let Some(key) = oack.user.keys().find(|k| !requested.user.contains(k)) {
        tracing::debug!("OACK carries undeclared option {}", key);
        return Err(ErrorKind::Deny);
    }

    let unrequested = (oack.blksize.is_some() && requested.blksize.is_none())
        || (oack.tsize.is_some() && requested.tsize.is_none())
        || (oack.timeout.is_some() && requested.timeout.is_none())
        || (oack.windowsize.is_some() && requested.windowsize.is_none())
        || (oack.rollover.is_some() && requested.rollover.is_none());
    if unrequested {
        return Err(ErrorKind::Deny);
    }

    let timeout = match oack.timeout {
        Some(ms) if ms > 0 && ms <= opts.timeout_millis() => Duration::from_millis(ms),
        Some(_) => return Err(ErrorKind::Deny),
        None => opts.timeout,
    };

    let block_size = match oack.blksize {
        Some(v) if (MIN_BLOCK_SIZE as u64..=opts.block_size as u64).contains(&v) => v as usize,
        Some(_) => return Err(ErrorKind::Deny),
        None => RFC_BLOCK_SIZE,
    };

    let transfer_size = match (oack.tsize, size) {
        (Some(v), Some(size)) if v != size => return Err(ErrorKind::Deny),
        (Some(v), _) => Some(v),
        (None, size) => size,
    };

    let window_size = match oack.windowsize {
        Some(v) if (1..=u64::from(opts.window_size)).contains(&v) => v as u16,
        Some(_) => return Err(ErrorKind::Deny),
        None => 1,
    };

    let rollover = match oack.rollover {
        Some(v @ (0 | 1)) => v as u8,
        Some(_) => return Err(ErrorKind::Deny),
        None => opts.rollover,
    };

    if oack.blksize.is_none() && !fits_unextended(transfer_size) {
        return Err(ErrorKind::FBig);
    }

    Ok(NegotiatedStats {
        block_size,
        window_size,
        transfer_size,
        rollover,
        timeout,
        local_addr: addrs.local,
        remote_addr: addrs.remote,
        user_extensions: oack.user.clone(),
        retries: opts.retries,
    })
}

/// What the server answers a request with
#[derive(Debug, Clone)]
pub struct Offer {
    /// Options to put in the OACK; empty means answer as plain RFC 1350
    pub reply: Extensions,
    pub stats: NegotiatedStats,
}

/// Build the server's answer to the options of a request
///
/// `size` is the real size of a GET. `echo` holds the user options the
/// request handler wants acknowledged; only keys the client sent survive.
pub fn offer(
    requested: &Extensions,
    opts: &GlobalOptions,
    direction: Direction,
    size: Option<u64>,
    echo: &UserExtensions,
    addrs: Addrs,
) -> Offer {
    let mut reply = Extensions::default();

    let block_size = match requested.blksize {
        Some(v) => {
            let v = v.min(opts.block_size as u64);
            reply.blksize = Some(v);
            v as usize
        }
        None => RFC_BLOCK_SIZE,
    };

    let window_size = match requested.windowsize {
        Some(v) => {
            let v = v.min(u64::from(opts.window_size));
            reply.windowsize = Some(v);
            v as u16
        }
        None => 1,
    };

    let transfer_size = match (direction, requested.tsize) {
        (Direction::Get, Some(_)) => {
            reply.tsize = size;
            size
        }
        (Direction::Put, Some(declared)) => {
            reply.tsize = Some(declared);
            Some(declared)
        }
        (Direction::Get, None) => size,
        (Direction::Put, None) => None,
    };

    let timeout = match requested.timeout {
        Some(ms) if ms > 0 && ms <= opts.timeout_millis() => {
            reply.timeout = Some(ms);
            Duration::from_millis(ms)
        }
        _ => opts.timeout,
    };

    let rollover = match requested.rollover {
        Some(v) => {
            reply.rollover = Some(v);
            v as u8
        }
        None => opts.rollover,
    };

    reply.user = echo
        .iter()
        .filter(|(k, _)| requested.user.contains(k))
        .collect();

    let stats = NegotiatedStats {
        block_size,
        window_size,
        transfer_size,
        rollover,
        timeout,
        local_addr: addrs.local,
        remote_addr: addrs.remote,
        user_extensions: reply.user.clone(),
        retries: opts.retries,
    };

    Offer { reply, stats }
}
