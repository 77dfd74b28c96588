//! Transfer options
//!
//! [`GlobalOptions`] is the per client / per server configuration, the
//! [`Extensions`] record is what travels in RRQ, WRQ and OACK packets, and
//! [`NegotiatedStats`] is the frozen outcome of negotiation that every
//! transfer runs on.

use std::net::SocketAddr;
use std::time::Duration;

/// Smallest block size allowed by RFC 2348
pub const MIN_BLOCK_SIZE: usize = 8;

/// Largest block size allowed by RFC 2348
pub const MAX_BLOCK_SIZE: usize = 65464;

/// Block size used by plain RFC 1350 peers
pub const RFC_BLOCK_SIZE: usize = 512;

/// Largest block that fits an Ethernet frame without IP fragmentation
pub const DEFAULT_BLOCK_SIZE: usize = 1468;

pub const DEFAULT_WINDOW_SIZE: u16 = 4;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_PORT: u16 = 69;

/// Largest file that can move with 512-byte blocks before the block counter
/// wraps: 65535 blocks of 512 bytes, rounded to 32 MiB
pub const MAX_UNEXTENDED_SIZE: u64 = 33_554_432;

/// Option names with a meaning defined by an RFC
pub const KNOWN_EXTENSIONS: [&str; 5] = ["blksize", "tsize", "timeout", "windowsize", "rollover"];

/// Whether `key` names one of the RFC-defined options
pub fn is_known_extension(key: &str) -> bool {
    KNOWN_EXTENSIONS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

/// Opaque key/value options, kept in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserExtensions(Vec<(String, String)>);

impl UserExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    ///
    /// Keys are case-insensitive on the wire and stored lowercased.
    ///
    /// # Examples
    /// ```
    /// use tftp::UserExtensions;
    ///
    /// let mut ext = UserExtensions::new();
    /// ext.insert("Color", "red");
    /// ext.insert("color", "blue");
    /// assert_eq!(ext.get("COLOR"), Some("blue"));
    /// assert_eq!(ext.len(), 1);
    /// ```
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` over `self`, `other` winning on conflicts
    pub fn merged(&self, other: &UserExtensions) -> UserExtensions {
        let mut merged = self.clone();
        for (k, v) in other.iter() {
            merged.insert(k, v);
        }
        merged
    }

    /// Drop keys that collide with RFC-defined options
    pub fn without_known(&self) -> UserExtensions {
        UserExtensions(
            self.0
                .iter()
                .filter(|(k, _)| !is_known_extension(k))
                .cloned()
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UserExtensions {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut ext = Self::new();
        for (k, v) in iter {
            ext.insert(k, v);
        }
        ext
    }
}

/// Option values carried by a request or an OACK
///
/// Known options are typed; anything else lands in `user`. Serialization
/// order is fixed: blksize, tsize, timeout, windowsize, rollover, then the
/// user options in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    pub blksize: Option<u64>,
    pub tsize: Option<u64>,
    /// Milliseconds
    pub timeout: Option<u64>,
    pub windowsize: Option<u64>,
    pub rollover: Option<u64>,
    pub user: UserExtensions,
}

impl Extensions {
    pub fn is_empty(&self) -> bool {
        self.blksize.is_none()
            && self.tsize.is_none()
            && self.timeout.is_none()
            && self.windowsize.is_none()
            && self.rollover.is_none()
            && self.user.is_empty()
    }

    /// Key/value pairs in wire order
    pub fn pairs(&self) -> Vec<(String, String)> {
        let known = [
            ("blksize", self.blksize),
            ("tsize", self.tsize),
            ("timeout", self.timeout),
            ("windowsize", self.windowsize),
            ("rollover", self.rollover),
        ];
        known
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v.to_string())))
            .chain(self.user.iter().map(|(k, v)| (k.to_string(), v.to_string())))
            .collect()
    }
}

/// Configuration shared by every transfer a client or server runs
///
/// The block size, window size and timeout are ceilings: negotiation can
/// lower them but never raise them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalOptions {
    /// Remote host for a client; ignored by the server
    pub address: String,
    pub port: u16,
    /// Retransmissions after the first send before giving up
    pub retries: u32,
    pub block_size: usize,
    pub window_size: u16,
    pub timeout: Duration,
    /// Block number that follows 65535
    pub rollover: u8,
    /// Sent with every request
    pub user_extensions: UserExtensions,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: DEFAULT_PORT,
            retries: DEFAULT_RETRIES,
            block_size: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            timeout: DEFAULT_TIMEOUT,
            rollover: 0,
            user_extensions: UserExtensions::new(),
        }
    }
}

impl GlobalOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_window_size(mut self, window_size: u16) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rollover(mut self, rollover: u8) -> Self {
        self.rollover = rollover;
        self
    }

    pub fn with_user_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_extensions.insert(key, value);
        self
    }

    /// Clamp every field into its valid range
    ///
    /// Values below one become one, an out-of-range block size falls back
    /// to the default and an unknown rollover becomes 0.
    ///
    /// # Examples
    /// ```
    /// use std::time::Duration;
    /// use tftp::GlobalOptions;
    ///
    /// let opts = GlobalOptions::default()
    ///     .with_block_size(4)
    ///     .with_window_size(0)
    ///     .with_timeout(Duration::ZERO)
    ///     .sanitized();
    /// assert_eq!(opts.block_size, 1468);
    /// assert_eq!(opts.window_size, 1);
    /// assert_eq!(opts.timeout, Duration::from_millis(1));
    /// ```
    pub fn sanitized(mut self) -> Self {
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        self.retries = self.retries.max(1);
        self.window_size = self.window_size.max(1);
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            self.block_size = DEFAULT_BLOCK_SIZE;
        }
        if self.timeout < Duration::from_millis(1) {
            self.timeout = Duration::from_millis(1);
        }
        if self.rollover > 1 {
            self.rollover = 0;
        }
        self.user_extensions = self.user_extensions.without_known();
        self
    }

    pub fn timeout_millis(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Extensions proposed in a request, with the given transfer size
    pub fn request_extensions(&self, tsize: u64, user: &UserExtensions) -> Extensions {
        Extensions {
            blksize: Some(self.block_size as u64),
            tsize: Some(tsize),
            timeout: Some(self.timeout_millis()),
            windowsize: Some(u64::from(self.window_size)),
            rollover: Some(u64::from(self.rollover)),
            user: self.user_extensions.merged(user).without_known(),
        }
    }
}

/// Outcome of negotiation, fixed for the rest of the transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedStats {
    pub block_size: usize,
    pub window_size: u16,
    /// Known once the peer declared it (or the local side knows it)
    pub transfer_size: Option<u64>,
    pub rollover: u8,
    pub timeout: Duration,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// User options the peer echoed back
    pub user_extensions: UserExtensions,
    pub retries: u32,
}

impl NegotiatedStats {
    /// Plain RFC 1350 parameters used when the peer ignores extensions
    pub fn rfc_defaults(opts: &GlobalOptions, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            block_size: RFC_BLOCK_SIZE,
            window_size: 1,
            transfer_size: None,
            rollover: opts.rollover,
            timeout: opts.timeout,
            local_addr,
            remote_addr,
            user_extensions: UserExtensions::new(),
            retries: opts.retries,
        }
    }
}
