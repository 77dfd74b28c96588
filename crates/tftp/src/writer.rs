//! Outbound window engine
//!
//! Slices the local byte stream into blocks, keeps up to one window of them
//! in flight and advances when the receiver acknowledges the window's last
//! block.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};

use crate::options::NegotiatedStats;
use crate::transport::Transport;
use crate::window::{Window, next_block};

#[derive(Debug)]
pub struct Writer {
    block_size: usize,
    window: Window,
    /// Declared total, when known up front
    size: Option<u64>,
    /// Input not yet cut into blocks
    buffered: BytesMut,
    /// Bytes already cut into blocks
    consumed: u64,
    eof: bool,
    in_flight: VecDeque<(u16, Bytes)>,
    next: u16,
    sent_in_window: u16,
    last_acked: u16,
    terminal_sent: bool,
    done: bool,
}

impl Writer {
    pub fn new(stats: &NegotiatedStats, size: Option<u64>) -> Self {
        Self::with_params(stats.block_size, stats.window_size, stats.rollover, size)
    }

    pub fn with_params(block_size: usize, window_size: u16, rollover: u8, size: Option<u64>) -> Self {
        let window = Window::first(window_size, rollover);
        Self {
            block_size,
            next: window.start(),
            window,
            size,
            buffered: BytesMut::new(),
            consumed: 0,
            eof: false,
            in_flight: VecDeque::new(),
            sent_in_window: 0,
            last_acked: 0,
            terminal_sent: false,
            done: false,
        }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Whether the engine should be fed more bytes right now
    pub fn needs_input(&self) -> bool {
        !self.done
            && !self.terminal_sent
            && !self.input_complete()
            && self.buffered.len() < self.block_size
            && self.sent_in_window < self.window.size()
    }

    /// Buffer the source reads into
    pub fn input(&mut self) -> &mut BytesMut {
        self.buffered.reserve(self.block_size);
        &mut self.buffered
    }

    fn input_complete(&self) -> bool {
        self.eof
            || self
                .size
                .is_some_and(|size| self.consumed + self.buffered.len() as u64 >= size)
    }

    /// Bytes were appended to [`Writer::input`]
    pub fn on_input(&mut self, t: &mut impl Transport) {
        if let Some(size) = self.size
            && self.consumed + self.buffered.len() as u64 > size
        {
            t.close(Err(io::Error::other(format!("source is longer than the declared {size} bytes")).into()));
            return;
        }
        self.pump(t);
    }

    /// The source reached its end
    pub fn finish_input(&mut self, t: &mut impl Transport) {
        self.eof = true;
        if let Some(size) = self.size {
            let total = self.consumed + self.buffered.len() as u64;
            if total < size {
                t.close(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended after {total} of {size} bytes"),
                )
                .into()));
                return;
            }
        }
        self.pump(t);
    }

    /// Cut the next block, if enough input is available
    fn next_payload(&mut self) -> Option<Bytes> {
        if self.buffered.len() >= self.block_size {
            return Some(self.buffered.split_to(self.block_size).freeze());
        }
        if self.input_complete() {
            // Short, possibly empty, terminal block
            return Some(self.buffered.split().freeze());
        }
        None
    }

    /// Send blocks while the window has room
    pub fn pump(&mut self, t: &mut impl Transport) {
        while !self.done && !self.terminal_sent && self.sent_in_window < self.window.size() {
            let Some(data) = self.next_payload() else {
                break;
            };
            self.consumed += data.len() as u64;
            if data.len() < self.block_size {
                self.terminal_sent = true;
            }
            t.send_block(self.next, &data);
            self.in_flight.push_back((self.next, data));
            self.next = next_block(self.next, self.window.rollover());
            self.sent_in_window += 1;
        }
        self.wait(t);
    }

    fn wait(&self, t: &mut impl Transport) {
        if !self.in_flight.is_empty() && (self.terminal_sent || self.sent_in_window == self.window.size()) {
            t.arm_timer();
        }
    }

    /// Last block the receiver has to acknowledge for this window
    fn window_end(&self) -> u16 {
        match self.in_flight.back() {
            Some((block, _)) if self.terminal_sent => *block,
            _ => self.window.end(),
        }
    }

    pub fn on_ack(&mut self, block: u16, t: &mut impl Transport) {
        if self.done {
            return;
        }

        if !self.in_flight.is_empty() && block == self.window_end() {
            self.in_flight.clear();
            self.last_acked = block;
            if self.terminal_sent {
                self.done = true;
                t.close(Ok(()));
                return;
            }
            self.window.advance();
            self.sent_in_window = 0;
            self.pump(t);
            return;
        }

        if block == self.last_acked {
            tracing::debug!("Receiver has nothing after block {}, resending window", block);
            self.resend(t);
        } else if let Some(pos) = self.in_flight.iter().position(|(b, _)| *b == block) {
            // Partial window; the rest goes out again when the timer fires
            self.in_flight.drain(..=pos);
            self.last_acked = block;
        } else {
            tracing::debug!("Ignoring ACK {} outside the window", block);
            return;
        }
        self.wait(t);
    }

    fn resend(&self, t: &mut impl Transport) {
        for (block, data) in &self.in_flight {
            t.send_block(*block, data);
        }
    }

    pub fn on_timeout(&mut self, t: &mut impl Transport) {
        if self.done {
            return;
        }
        self.resend(t);
        self.wait(t);
    }
}
