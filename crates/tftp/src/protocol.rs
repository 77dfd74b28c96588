//! TFTP Packet Codec
//!
//! Encoding and decoding of the six TFTP message types defined by RFC 1350
//! and RFC 2347. Every function here is pure: it turns a datagram into a
//! [`Packet`] or a packet into the bytes of a datagram.
//!
//! # Wire format
//!
//! All 16-bit fields are big-endian.
//!
//! | Opcode | Name  | Layout                                              |
//! |--------|-------|-----------------------------------------------------|
//! | 1      | RRQ   | op, filename\0, mode\0, \[key\0 value\0\]*          |
//! | 2      | WRQ   | same layout as RRQ                                  |
//! | 3      | DATA  | op, block, payload                                  |
//! | 4      | ACK   | op, block                                           |
//! | 5      | ERROR | op, code, message\0                                 |
//! | 6      | OACK  | op, \[key\0 value\0\]*                              |
//!
//! Decoding never panics on hostile input: a truncated buffer or a missing
//! NUL terminator yields `EBADMSG`.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, Result};
use crate::options::{Extensions, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Length of the opcode plus block number header of DATA and ACK packets
pub const HEADER_LEN: usize = 4;

/// Shortest datagram that can hold a valid request ("a\0octet\0" plus opcode)
pub const MIN_REQUEST_LEN: usize = 9;

/// TFTP Protocol Opcodes
///
/// Each opcode identifies the layout of the rest of the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// A payload shorter than the negotiated block size ends the transfer.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// With windowed transfers one ACK covers every block up to and
    /// including the one it names. Block 0 acknowledges an OACK.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,

    /// Option Acknowledgment (OACK) - Opcode 6
    ///
    /// Packet format: | Opcode | Opt1 | 0 | Value1 | 0 | ... |
    OptionAck = 6,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(TftpOpcode::OptionAck.name(), "OACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Transfer Modes
///
/// All three RFC 1350 modes are accepted on the wire, but content is always
/// moved byte for byte: netascii translation and mail delivery are not
/// performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferMode {
    #[default]
    Octet,
    NetAscii,
    Mail,
}

impl TransferMode {
    /// Parse a mode string case-insensitively
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!(TransferMode::from_str_opt("OCTET"), Some(TransferMode::Octet));
    /// assert_eq!(TransferMode::from_str_opt("netascii"), Some(TransferMode::NetAscii));
    /// assert_eq!(TransferMode::from_str_opt("binary"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            "mail" => Some(Self::Mail),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
            Self::Mail => "mail",
        }
    }
}

impl FromStr for TransferMode {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or(ErrorKind::BadMode)
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded RRQ or WRQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// File name exactly as sent; see [`crate::names`] for validation
    pub filename: String,
    pub mode: TransferMode,
    /// `None` when the request carried no option pairs at all
    pub extensions: Option<Extensions>,
}

/// A decoded TFTP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, data: Bytes },
    Ack(u16),
    Error { code: u16, message: String },
    Oack(Extensions),
}

impl Packet {
    /// Decode a datagram
    ///
    /// Unknown opcodes fail with `EBADOP`, everything else that cannot be
    /// decoded fails with `EBADMSG` (or `EBADMODE`/`EBADNAME` for requests).
    ///
    /// # Examples
    /// ```
    /// use tftp::{Packet, build_ack};
    ///
    /// let packet = Packet::parse(build_ack(7)).unwrap();
    /// assert_eq!(packet, Packet::Ack(7));
    /// ```
    pub fn parse(buf: Bytes) -> Result<Self> {
        let opcode = get_tftp_opcode(&buf).ok_or_else(|| {
            if buf.len() < 2 {
                ErrorKind::BadMsg
            } else {
                ErrorKind::BadOp
            }
        })?;

        let packet = match opcode {
            TftpOpcode::ReadRequest => Self::Rrq(parse_request(&buf)?),
            TftpOpcode::WriteRequest => Self::Wrq(parse_request(&buf)?),
            TftpOpcode::Data => {
                let (block, data) = parse_data(&buf)?;
                Self::Data { block, data }
            }
            TftpOpcode::Acknowledgment => Self::Ack(parse_ack(&buf)?),
            TftpOpcode::Error => {
                let (code, message) = parse_error(&buf)?;
                Self::Error { code, message }
            }
            TftpOpcode::OptionAck => Self::Oack(parse_oack(&buf)?),
        };
        Ok(packet)
    }

    /// Encode the packet into a datagram
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Rrq(req) => build_request(
                TftpOpcode::ReadRequest,
                &req.filename,
                req.mode,
                req.extensions.as_ref(),
            ),
            Self::Wrq(req) => build_request(
                TftpOpcode::WriteRequest,
                &req.filename,
                req.mode,
                req.extensions.as_ref(),
            ),
            Self::Data { block, data } => build_data(*block, data),
            Self::Ack(block) => build_ack(*block),
            Self::Error { code, message } => build_error(*code, message),
            Self::Oack(extensions) => build_oack(extensions),
        }
    }

    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::Rrq(_) => TftpOpcode::ReadRequest,
            Self::Wrq(_) => TftpOpcode::WriteRequest,
            Self::Data { .. } => TftpOpcode::Data,
            Self::Ack(_) => TftpOpcode::Acknowledgment,
            Self::Error { .. } => TftpOpcode::Error,
            Self::Oack(_) => TftpOpcode::OptionAck,
        }
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?
        .iter()
        .position(|&b| b == 0)
        .map(|pos| start + pos)
}

/// Read a NUL-terminated field, returning it and the offset past the NUL
fn read_field(buf: &[u8], start: usize) -> Result<(&[u8], usize)> {
    let end = find_zero(buf, start).ok_or(ErrorKind::BadMsg)?;
    Ok((&buf[start..end], end + 1))
}

fn read_ascii(field: &[u8]) -> Result<String> {
    std::str::from_utf8(field)
        .map(str::to_string)
        .map_err(|_| ErrorKind::BadMsg.into())
}

/// Parse a numeric extension value
///
/// Values with a decimal point, a sign, or anything else that is not a plain
/// unsigned integer are malformed.
fn parse_number(value: &str) -> Result<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ErrorKind::BadMsg.into());
    }
    value.parse::<u64>().map_err(|_| ErrorKind::BadMsg.into())
}

/// Parse the key/value pairs starting at `start`
fn parse_pairs(buf: &[u8], mut start: usize) -> Result<Extensions> {
    let mut extensions = Extensions::default();

    while start < buf.len() {
        let (key, next) = read_field(buf, start)?;
        let (value, next) = read_field(buf, next)?;
        start = next;

        let key = read_ascii(key)?.to_ascii_lowercase();
        let value = read_ascii(value)?;

        match key.as_str() {
            "blksize" => extensions.blksize = Some(parse_number(&value)?),
            "tsize" => extensions.tsize = Some(parse_number(&value)?),
            "timeout" => extensions.timeout = Some(parse_number(&value)?),
            "windowsize" => extensions.windowsize = Some(parse_number(&value)?),
            "rollover" => extensions.rollover = Some(parse_number(&value)?),
            _ => extensions.user.insert(key, value),
        }
    }

    Ok(extensions)
}

/// Check known request extensions against their protocol ranges
fn validate_request_extensions(opcode: TftpOpcode, ext: &Extensions) -> Result<()> {
    let in_range = ext
        .blksize
        .is_none_or(|v| (MIN_BLOCK_SIZE as u64..=MAX_BLOCK_SIZE as u64).contains(&v))
        && ext.windowsize.is_none_or(|v| (1..=65535).contains(&v))
        && ext.rollover.is_none_or(|v| v <= 1)
        && ext.timeout.is_none_or(|v| v >= 1)
        && (opcode != TftpOpcode::ReadRequest || ext.tsize.is_none_or(|v| v == 0));

    if in_range {
        Ok(())
    } else {
        Err(ErrorKind::BadMsg.into())
    }
}

/// Parse an RRQ or WRQ packet
///
/// # Examples
/// ```
/// use tftp::{TftpOpcode, TransferMode, build_request, parse_request};
///
/// let buf = build_request(TftpOpcode::ReadRequest, "boot.img", TransferMode::Octet, None);
/// let request = parse_request(&buf).unwrap();
/// assert_eq!(request.filename, "boot.img");
/// assert!(request.extensions.is_none());
/// ```
pub fn parse_request(buf: &[u8]) -> Result<Request> {
    let opcode = get_tftp_opcode(buf).ok_or(ErrorKind::BadMsg)?;
    if !matches!(opcode, TftpOpcode::ReadRequest | TftpOpcode::WriteRequest) {
        return Err(ErrorKind::BadOp.into());
    }

    let (filename, next) = read_field(buf, 2)?;
    let filename = std::str::from_utf8(filename)
        .map_err(|_| ErrorKind::BadName)?
        .to_string();

    let (mode, next) = read_field(buf, next)?;
    let mode = read_ascii(mode)?.parse::<TransferMode>()?;

    let extensions = if next < buf.len() {
        let extensions = parse_pairs(buf, next)?;
        validate_request_extensions(opcode, &extensions)?;
        Some(extensions)
    } else {
        None
    };

    Ok(Request {
        filename,
        mode,
        extensions,
    })
}

/// Parse a DATA packet into its block number and payload
pub fn parse_data(buf: &Bytes) -> Result<(u16, Bytes)> {
    if buf.len() < HEADER_LEN {
        return Err(ErrorKind::BadMsg.into());
    }
    let block = u16::from_be_bytes([buf[2], buf[3]]);
    Ok((block, buf.slice(HEADER_LEN..)))
}

/// Parse an ACK packet
pub fn parse_ack(buf: &[u8]) -> Result<u16> {
    if buf.len() != HEADER_LEN {
        return Err(ErrorKind::BadMsg.into());
    }
    Ok(u16::from_be_bytes([buf[2], buf[3]]))
}

/// Parse an ERROR packet into its code and message
pub fn parse_error(buf: &[u8]) -> Result<(u16, String)> {
    if buf.len() < 5 {
        return Err(ErrorKind::BadMsg.into());
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let (message, _) = read_field(buf, 4)?;
    Ok((code, String::from_utf8_lossy(message).into_owned()))
}

/// Parse an OACK packet
///
/// Values are decoded but not range checked; deciding whether the peer's
/// answer is acceptable is the negotiator's job.
pub fn parse_oack(buf: &[u8]) -> Result<Extensions> {
    if buf.len() < 2 {
        return Err(ErrorKind::BadMsg.into());
    }
    parse_pairs(buf, 2)
}

fn put_pairs(buf: &mut BytesMut, extensions: &Extensions) {
    for (key, value) in extensions.pairs() {
        buf.put_slice(key.as_bytes());
        buf.put_u8(0);
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }
}

/// Build an RRQ or WRQ packet
pub fn build_request(
    opcode: TftpOpcode,
    filename: &str,
    mode: TransferMode,
    extensions: Option<&Extensions>,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + filename.len());
    buf.put_u16(opcode.as_u16());
    buf.put_slice(filename.as_bytes());
    buf.put_u8(0);
    buf.put_slice(mode.as_str().as_bytes());
    buf.put_u8(0);
    if let Some(extensions) = extensions {
        put_pairs(&mut buf, extensions);
    }
    buf.freeze()
}

/// Build a DATA packet
pub fn build_data(block: u16, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_u16(TftpOpcode::Data.as_u16());
    buf.put_u16(block);
    buf.put_slice(data);
    buf.freeze()
}

/// Build an ACK packet
pub fn build_ack(block: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u16(TftpOpcode::Acknowledgment.as_u16());
    buf.put_u16(block);
    buf.freeze()
}

/// Build an ERROR packet
pub fn build_error(code: u16, msg: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + msg.len());
    buf.put_u16(TftpOpcode::Error.as_u16());
    buf.put_u16(code);
    buf.put_slice(msg.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// Build an ERROR packet carrying the canonical message of `kind`
pub fn build_error_kind(kind: ErrorKind) -> Bytes {
    build_error(kind.code(), kind.message())
}

/// Build an OACK packet
pub fn build_oack(extensions: &Extensions) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u16(TftpOpcode::OptionAck.as_u16());
    put_pairs(&mut buf, extensions);
    buf.freeze()
}

/// Get the opcode from a TFTP packet
pub fn get_opcode(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Get the typed opcode from a TFTP packet
pub fn get_tftp_opcode(buf: &[u8]) -> Option<TftpOpcode> {
    get_opcode(buf).and_then(TftpOpcode::from_u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn kind_of(result: Result<impl fmt::Debug>) -> ErrorKind {
        match result {
            Err(Error::Protocol { kind }) => kind,
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_request_with_extensions() {
        let mut ext = Extensions {
            blksize: Some(1468),
            tsize: Some(0),
            timeout: Some(3000),
            windowsize: Some(4),
            rollover: Some(0),
            ..Default::default()
        };
        ext.user.insert("x-token", "abc");

        let buf = build_request(TftpOpcode::ReadRequest, "pxe/boot.img", TransferMode::Octet, Some(&ext));
        let packet = Packet::parse(buf.clone()).unwrap();
        let Packet::Rrq(request) = packet else {
            panic!("expected RRQ");
        };
        assert_eq!(request.filename, "pxe/boot.img");
        assert_eq!(request.extensions, Some(ext));

        let text = String::from_utf8_lossy(&buf[2..]);
        let order: Vec<&str> = text.split('\0').collect();
        assert_eq!(
            order,
            [
                "pxe/boot.img",
                "octet",
                "blksize",
                "1468",
                "tsize",
                "0",
                "timeout",
                "3000",
                "windowsize",
                "4",
                "rollover",
                "0",
                "x-token",
                "abc",
                ""
            ]
        );
    }

    #[test]
    fn test_request_keys_are_case_insensitive() {
        let buf = b"\x00\x02file\x00NetAscii\x00BLKSIZE\x00512\x00TSize\x0010\x00";
        let request = parse_request(buf).unwrap();
        assert_eq!(request.mode, TransferMode::NetAscii);
        let ext = request.extensions.unwrap();
        assert_eq!(ext.blksize, Some(512));
        assert_eq!(ext.tsize, Some(10));
    }

    #[test]
    fn test_request_rejects_bad_values() {
        let cases: [&[u8]; 7] = [
            b"\x00\x01f\x00octet\x00blksize\x0012.5\x00",
            b"\x00\x01f\x00octet\x00blksize\x00abc\x00",
            b"\x00\x01f\x00octet\x00blksize\x007\x00",
            b"\x00\x01f\x00octet\x00tsize\x0010\x00",
            b"\x00\x01f\x00octet\x00windowsize\x000\x00",
            b"\x00\x01f\x00octet\x00rollover\x002\x00",
            b"\x00\x01f\x00octet\x00blksize\x00",
        ];
        for buf in cases {
            assert_eq!(kind_of(parse_request(buf)), ErrorKind::BadMsg, "{buf:?}");
        }

        // tsize is only pinned to zero for reads
        let wrq = b"\x00\x02f\x00octet\x00tsize\x0010\x00";
        assert_eq!(parse_request(wrq).unwrap().extensions.unwrap().tsize, Some(10));
    }

    #[test]
    fn test_request_bad_mode_and_truncation() {
        assert_eq!(kind_of(parse_request(b"\x00\x01f\x00binary\x00")), ErrorKind::BadMode);
        assert_eq!(kind_of(parse_request(b"\x00\x01file")), ErrorKind::BadMsg);
        assert_eq!(kind_of(parse_request(b"\x00\x01file\x00octet")), ErrorKind::BadMsg);
        assert_eq!(kind_of(parse_request(b"\x00\x01\xff\xfe\x00octet\x00")), ErrorKind::BadName);
    }

    #[test]
    fn test_data_packet() {
        let buf = build_data(42, b"Hello");
        assert_eq!(&buf[..4], &[0, 3, 0, 42]);
        let (block, data) = parse_data(&buf).unwrap();
        assert_eq!(block, 42);
        assert_eq!(&data[..], b"Hello");

        // Empty terminal block
        let (block, data) = parse_data(&build_data(65535, b"")).unwrap();
        assert_eq!(block, 65535);
        assert!(data.is_empty());

        assert_eq!(kind_of(parse_data(&Bytes::from_static(b"\x00\x03\x00"))), ErrorKind::BadMsg);
    }

    #[test]
    fn test_ack_packet() {
        assert_eq!(&build_ack(0x0102)[..], &[0, 4, 1, 2]);
        assert_eq!(parse_ack(&[0, 4, 0xff, 0xff]).unwrap(), 65535);
        assert_eq!(kind_of(parse_ack(&[0, 4, 1])), ErrorKind::BadMsg);
        assert_eq!(kind_of(parse_ack(&[0, 4, 1, 2, 3])), ErrorKind::BadMsg);
    }

    #[test]
    fn test_error_packet() {
        let buf = build_error(1, "File not found");
        assert_eq!(&buf[..4], &[0, 5, 0, 1]);
        assert_eq!(*buf.last().unwrap(), 0);
        let (code, message) = parse_error(&buf).unwrap();
        assert_eq!(code, 1);
        assert_eq!(message, "File not found");

        let buf = build_error_kind(ErrorKind::Socket);
        assert_eq!(parse_error(&buf).unwrap(), (0, "Invalid remote socket".to_string()));

        assert_eq!(kind_of(parse_error(b"\x00\x05\x00\x01oops")), ErrorKind::BadMsg);
    }

    #[test]
    fn test_oack_packet() {
        let mut ext = Extensions {
            blksize: Some(1024),
            windowsize: Some(8),
            ..Default::default()
        };
        ext.user.insert("color", "blue");
        let packet = Packet::Oack(ext.clone());
        assert_eq!(Packet::parse(packet.to_bytes()).unwrap(), packet);

        // Out-of-range values are decoded; the negotiator rejects them
        let parsed = parse_oack(b"\x00\x06blksize\x0099999\x00").unwrap();
        assert_eq!(parsed.blksize, Some(99999));
        assert_eq!(kind_of(parse_oack(b"\x00\x06timeout\x001.5\x00")), ErrorKind::BadMsg);
        assert_eq!(kind_of(parse_oack(b"\x00\x06blksize\x00")), ErrorKind::BadMsg);

        assert_eq!(parse_oack(b"\x00\x06").unwrap(), Extensions::default());
    }

    #[test]
    fn test_parse_unknown_opcode() {
        assert_eq!(kind_of(Packet::parse(Bytes::from_static(b"\x00\x09abc"))), ErrorKind::BadOp);
        assert_eq!(kind_of(Packet::parse(Bytes::from_static(b"\x00"))), ErrorKind::BadMsg);
    }

    #[test]
    fn test_get_opcode() {
        assert_eq!(get_opcode(&[0, 1, 2, 3]), Some(1));
        assert_eq!(get_opcode(&[0]), None);
        assert_eq!(get_tftp_opcode(&[0, 6]), Some(TftpOpcode::OptionAck));
        assert_eq!(get_tftp_opcode(&[0, 7]), None);
    }

    #[test]
    fn test_find_zero() {
        let buf = b"hello\0world\0";
        assert_eq!(find_zero(buf, 0), Some(5));
        assert_eq!(find_zero(buf, 6), Some(11));
        assert_eq!(find_zero(b"no null", 0), None);
        assert_eq!(find_zero(buf, 100), None);
    }
}
