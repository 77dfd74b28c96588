//! Inbound window engine
//!
//! Receives DATA blocks into a fixed ring indexed by their offset in the
//! current window, acknowledges each completed window with one cumulative
//! ACK and hands payload to the transport in block order.

use bytes::Bytes;

use crate::error::ErrorKind;
use crate::options::NegotiatedStats;
use crate::transport::Transport;
use crate::window::Window;

#[derive(Debug)]
pub struct Reader {
    block_size: usize,
    window: Window,
    slots: Vec<Option<Bytes>>,
    /// Occupied slots in the current window
    received: usize,
    /// Offset of the short block that ends the transfer
    terminal: Option<usize>,
    /// Leading slots already handed over after a partial acknowledgment
    delivered: usize,
    last_ack: u16,
    done: bool,
}

impl Reader {
    pub fn new(stats: &NegotiatedStats) -> Self {
        Self::with_params(stats.block_size, stats.window_size, stats.rollover)
    }

    pub fn with_params(block_size: usize, window_size: u16, rollover: u8) -> Self {
        let window = Window::first(window_size, rollover);
        Self {
            block_size,
            slots: vec![None; usize::from(window.size())],
            window,
            received: 0,
            terminal: None,
            delivered: 0,
            last_ack: 0,
            done: false,
        }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Whether any DATA has been accepted yet
    pub fn has_data(&self) -> bool {
        self.received > 0 || self.last_ack != 0 || self.window.start() != 1
    }

    /// Blocks needed to complete the current window
    fn expected(&self) -> usize {
        self.terminal.map_or(self.slots.len(), |t| t + 1)
    }

    fn contiguous(&self) -> usize {
        self.slots[..self.expected()]
            .iter()
            .take_while(|s| s.is_some())
            .count()
    }

    fn deliver_until(&mut self, end: usize, t: &mut impl Transport) {
        for slot in &self.slots[self.delivered..end] {
            // Empty blocks only mark the end of a transfer
            if let Some(data) = slot
                && !data.is_empty()
            {
                t.deliver(data.clone());
            }
        }
        self.delivered = self.delivered.max(end);
    }

    pub fn on_data(&mut self, block: u16, data: Bytes, t: &mut impl Transport) {
        if self.done {
            tracing::debug!("Dropping late DATA block {}", block);
            return;
        }
        if data.len() > self.block_size {
            t.fail(ErrorKind::BadMsg);
            return;
        }

        let Some(offset) = self.window.offset(block) else {
            tracing::debug!(
                "Ignoring DATA block {} outside window {}..={}",
                block,
                self.window.start(),
                self.window.end()
            );
            return;
        };
        if self.slots[offset].is_some() || self.terminal.is_some_and(|end| offset > end) {
            tracing::debug!("Ignoring duplicate DATA block {}", block);
            return;
        }

        let short = data.len() < self.block_size;
        self.slots[offset] = Some(data);
        self.received += 1;

        if short && self.terminal.is_none_or(|end| offset < end) {
            self.terminal = Some(offset);
            for slot in &mut self.slots[offset + 1..] {
                *slot = None;
            }
            self.received = self.slots.iter().filter(|s| s.is_some()).count();
        }

        if self.received == self.expected() {
            self.complete_window(t);
        } else {
            t.arm_timer();
        }
    }

    fn complete_window(&mut self, t: &mut impl Transport) {
        let expected = self.expected();
        let last = self.window.block_at(expected - 1);
        t.send_ack(last);
        self.last_ack = last;
        self.deliver_until(expected, t);

        if self.terminal.is_some() {
            self.done = true;
            t.close(Ok(()));
            return;
        }

        self.window.advance();
        self.slots.iter_mut().for_each(|s| *s = None);
        self.received = 0;
        self.delivered = 0;
        t.arm_timer();
    }

    /// Ask the sender for what is missing
    ///
    /// Acknowledges the contiguous prefix received so far, handing it over
    /// since the sender will not repeat it, or repeats the previous
    /// acknowledgment when nothing in this window arrived in order.
    pub fn on_timeout(&mut self, t: &mut impl Transport) {
        if self.done {
            return;
        }
        let prefix = self.contiguous();
        if prefix > 0 {
            let block = self.window.block_at(prefix - 1);
            t.send_ack(block);
            self.last_ack = block;
            self.deliver_until(prefix, t);
        } else {
            t.send_ack(self.last_ack);
        }
        t.arm_timer();
    }
}
