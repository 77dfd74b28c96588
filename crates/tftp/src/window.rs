//! Window boundaries and 16-bit block arithmetic
//!
//! Block numbers live in `0..=65535`. The first DATA block of a transfer is
//! block 1; the block that follows 65535 is the negotiated rollover value
//! (0 or 1). A window is the run of `size` consecutive block numbers
//! starting at `start`, possibly wrapping past 65535.

/// The block number that follows `block`
///
/// # Examples
/// ```
/// use tftp::window::next_block;
///
/// assert_eq!(next_block(7, 0), 8);
/// assert_eq!(next_block(65535, 0), 0);
/// assert_eq!(next_block(65535, 1), 1);
/// ```
pub fn next_block(block: u16, rollover: u8) -> u16 {
    add(block, 1, rollover)
}

/// `block + n`, wrapping past 65535 to `rollover`
pub fn add(block: u16, n: u32, rollover: u8) -> u16 {
    let v = u32::from(block) + n;
    if v > 65535 {
        (v - 65536 + u32::from(rollover)) as u16
    } else {
        v as u16
    }
}

/// A window of consecutive block numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    start: u16,
    size: u16,
    rollover: u8,
}

impl Window {
    /// The first window of a transfer, starting at block 1
    pub fn first(size: u16, rollover: u8) -> Self {
        Self::new(1, size, rollover)
    }

    pub fn new(start: u16, size: u16, rollover: u8) -> Self {
        Self {
            start,
            size: size.max(1),
            rollover,
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn rollover(&self) -> u8 {
        self.rollover
    }

    /// Last block number of the window
    pub fn end(&self) -> u16 {
        add(self.start, u32::from(self.size) - 1, self.rollover)
    }

    /// Whether the window straddles the 65535 wrap point
    pub fn may_rollover(&self) -> bool {
        u32::from(self.start) + u32::from(self.size) - 1 > 65535
    }

    /// Position of `block` inside the window, if it belongs to it
    ///
    /// A block numbered below `start` is accepted only when the window
    /// straddles the wrap point.
    ///
    /// # Examples
    /// ```
    /// use tftp::window::Window;
    ///
    /// let w = Window::new(65534, 4, 1);
    /// assert!(w.may_rollover());
    /// assert_eq!(w.offset(65535), Some(1));
    /// assert_eq!(w.offset(1), Some(2));
    /// assert_eq!(w.offset(3), None);
    ///
    /// let w = Window::new(10, 4, 0);
    /// assert_eq!(w.offset(9), None);
    /// assert_eq!(w.offset(13), Some(3));
    /// ```
    pub fn offset(&self, block: u16) -> Option<usize> {
        let size = usize::from(self.size);
        let offset = if block >= self.start {
            usize::from(block - self.start)
        } else if self.may_rollover() && block >= u16::from(self.rollover) {
            65536 - usize::from(self.start) + usize::from(block - u16::from(self.rollover))
        } else {
            return None;
        };
        (offset < size).then_some(offset)
    }

    pub fn contains(&self, block: u16) -> bool {
        self.offset(block).is_some()
    }

    /// Block number at `offset` from the start
    pub fn block_at(&self, offset: usize) -> u16 {
        add(self.start, offset as u32, self.rollover)
    }

    /// Move to the next window, right after the current end
    pub fn advance(&mut self) {
        self.start = next_block(self.end(), self.rollover);
    }
}
