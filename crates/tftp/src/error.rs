//! TFTP Error Taxonomy
//!
//! The closed set of conditions a transfer can end with. RFC 1350 defines the
//! codes 1 to 7 and RFC 2347 adds code 8; everything else is a local condition
//! that travels on the wire (when it travels at all) as code 0 with a
//! free-form message.

use std::fmt;
use std::io;

use thiserror::Error;

/// Every error condition known to the engine.
///
/// The first eight variants map one-to-one onto the RFC error codes. The rest
/// are local conditions reported with code 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `ENOENT` (1): file not found
    NoEnt,
    /// `EACCESS` (2): access violation
    Access,
    /// `ENOSPC` (3): disk full or allocation exceeded
    NoSpace,
    /// `EBADOP` (4): illegal TFTP operation
    BadOp,
    /// `ETID` (5): unknown transfer ID
    Tid,
    /// `EEXIST` (6): file already exists
    Exist,
    /// `ENOUSER` (7): no such user
    NoUser,
    /// `EDENY` (8): option negotiation denied
    Deny,
    /// `ESOCKET`: message received from a foreign endpoint
    Socket,
    /// `EBADMSG`: malformed or truncated message
    BadMsg,
    /// `EABORT`: transfer aborted by the user
    Abort,
    /// `EFBIG`: file too large without the blksize extension
    FBig,
    /// `ETIME`: retransmissions exhausted
    Time,
    /// `EBADMODE`: unknown transfer mode
    BadMode,
    /// `EBADNAME`: invalid file name
    BadName,
    /// `EISDIR`: path is a directory
    IsDir,
    /// `EIO`: local I/O failure
    Io,
    /// `ENOGET`: the server refuses GET requests
    NoGet,
    /// `ENOPUT`: the server refuses PUT requests
    NoPut,
}

impl ErrorKind {
    /// Wire error code (0 for local-only conditions)
    pub fn code(self) -> u16 {
        match self {
            Self::NoEnt => 1,
            Self::Access => 2,
            Self::NoSpace => 3,
            Self::BadOp => 4,
            Self::Tid => 5,
            Self::Exist => 6,
            Self::NoUser => 7,
            Self::Deny => 8,
            _ => 0,
        }
    }

    /// Look up the RFC condition for a non-zero wire code
    ///
    /// # Examples
    /// ```
    /// use tftp::ErrorKind;
    ///
    /// assert_eq!(ErrorKind::from_code(1), Some(ErrorKind::NoEnt));
    /// assert_eq!(ErrorKind::from_code(0), None);
    /// assert_eq!(ErrorKind::from_code(9), None);
    /// ```
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::NoEnt),
            2 => Some(Self::Access),
            3 => Some(Self::NoSpace),
            4 => Some(Self::BadOp),
            5 => Some(Self::Tid),
            6 => Some(Self::Exist),
            7 => Some(Self::NoUser),
            8 => Some(Self::Deny),
            _ => None,
        }
    }

    /// Canonical errno-style name, e.g. `ETIME`
    pub fn name(self) -> &'static str {
        match self {
            Self::NoEnt => "ENOENT",
            Self::Access => "EACCESS",
            Self::NoSpace => "ENOSPC",
            Self::BadOp => "EBADOP",
            Self::Tid => "ETID",
            Self::Exist => "EEXIST",
            Self::NoUser => "ENOUSER",
            Self::Deny => "EDENY",
            Self::Socket => "ESOCKET",
            Self::BadMsg => "EBADMSG",
            Self::Abort => "EABORT",
            Self::FBig => "EFBIG",
            Self::Time => "ETIME",
            Self::BadMode => "EBADMODE",
            Self::BadName => "EBADNAME",
            Self::IsDir => "EISDIR",
            Self::Io => "EIO",
            Self::NoGet => "ENOGET",
            Self::NoPut => "ENOPUT",
        }
    }

    /// Message sent in ERROR packets and shown to callers
    pub fn message(self) -> &'static str {
        match self {
            Self::NoEnt => "File not found",
            Self::Access => "Access violation",
            Self::NoSpace => "Disk full or allocation exceeded",
            Self::BadOp => "Illegal TFTP operation",
            Self::Tid => "Unknown transfer ID",
            Self::Exist => "File already exists",
            Self::NoUser => "No such user",
            Self::Deny => "The request has been denied",
            Self::Socket => "Invalid remote socket",
            Self::BadMsg => "Malformed TFTP message",
            Self::Abort => "Aborted",
            Self::FBig => "File bigger than 33554432 bytes",
            Self::Time => "Timed out",
            Self::BadMode => "Invalid transfer mode",
            Self::BadName => "Invalid filename",
            Self::IsDir => "Path is a directory",
            Self::Io => "I/O error",
            Self::NoGet => "Cannot GET files",
            Self::NoPut => "Cannot PUT files",
        }
    }

    /// Whether this condition has its own RFC error code
    pub fn is_rfc(self) -> bool {
        self.code() != 0
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Terminal error of a transfer
#[derive(Error, Debug)]
pub enum Error {
    /// A local protocol condition
    #[error("{kind}")]
    Protocol { kind: ErrorKind },

    /// The peer sent an ERROR packet
    #[error("remote error {code}: {message}")]
    Remote { code: u16, message: String },

    /// The transfer was cancelled locally
    #[error("{0}")]
    Aborted(String),

    /// The byte source or sink failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The received content does not match the expected digest
    #[error("invalid {0}, the file is corrupted")]
    Checksum(&'static str),
}

impl Error {
    /// Map the error back onto the taxonomy
    ///
    /// Remote errors carrying code 0 and digest mismatches have no entry.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Protocol { kind } => Some(*kind),
            Self::Remote { code, .. } => ErrorKind::from_code(*code),
            Self::Aborted(_) => Some(ErrorKind::Abort),
            Self::Io(_) => Some(ErrorKind::Io),
            Self::Checksum(_) => None,
        }
    }

    /// Whether the error originated at the peer
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::Protocol { kind }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
