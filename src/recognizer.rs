// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Byte-at-a-time request frame recognizer
//!
//! Frames share the wire with arbitrary traffic, so every header byte is
//! validated as it arrives. When a tentative header fails, the bytes it had
//! swallowed after its sentinel are scanned again from idle; anything that
//! turns out not to be protocol data is released for pass-through in the
//! order it arrived.

use std::collections::VecDeque;
use tracing::{debug, trace};
use crate::checksum::{Adler32, Fletcher16};
use crate::protocol::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    CyclicNumber,
    Function,
    SizeHi,
    SizeMid,
    SizeLo,
    HeaderCheckHi,
    HeaderCheckLo,
    Payload,
    PayloadCheck,
}

/// Coarse view of where the recognizer is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A sentinel was seen and a header is being checked
    Header,
    /// A validated header's payload is being buffered
    Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Bare ACK from the Master; the size field holds its option
    Ping(Header),
    /// A request ready to dispatch; a buffered payload is in `payload()`
    Request(Header, Request),
    /// A buffered payload failed its trailing checksum
    Corrupt(Header),
}

pub struct Recognizer {
    state: RxState,
    header_sum: Option<Fletcher16>,
    payload_sum: Adler32,
    pending: [u8; HEADER_LEN],
    pending_len: usize,
    cyclic: u8,
    function: Function,
    size: u32,
    expected_check: u16,
    received_check: u32,
    check_len: usize,
    buffer: [u8; SMALL_BUFFER_CAPACITY],
    data_len: usize,
    expected_len: usize,
    released: VecDeque<u8>,
}

impl Default for Recognizer {
    fn default() -> Self {
        Recognizer::new()
    }
}

impl Recognizer {
    pub fn new() -> Self {
        Recognizer {
            state: RxState::Idle,
            header_sum: None,
            payload_sum: Adler32::new(),
            pending: [0; HEADER_LEN],
            pending_len: 0,
            cyclic: 0,
            function: Function::Ack,
            size: 0,
            expected_check: 0,
            received_check: 0,
            check_len: 0,
            buffer: [0; SMALL_BUFFER_CAPACITY],
            data_len: 0,
            expected_len: 0,
            released: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            RxState::Idle => Phase::Idle,
            RxState::Payload | RxState::PayloadCheck => Phase::Payload,
            _ => Phase::Header,
        }
    }

    /// Payload of the most recent `Event::Request`.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.data_len]
    }

    /// Next byte of ordinary traffic, if any has been released.
    pub fn take_released(&mut self) -> Option<u8> {
        self.released.pop_front()
    }

    pub fn feed(&mut self, byte: u8) -> Option<Event> {
        match self.state {
            RxState::Idle => {
                if byte == STX {
                    // Preload the header sum with the sentinel's contribution
                    let mut sum = Fletcher16::new();
                    sum.update(STX);
                    self.header_sum = Some(sum);
                    self.pending[0] = STX;
                    self.pending_len = 1;
                    self.state = RxState::CyclicNumber;
                } else {
                    self.released.push_back(byte);
                }
                None
            }
            RxState::CyclicNumber => match Direction::Request.decode_cyclic(byte) {
                Some(cyclic) => {
                    self.cyclic = cyclic;
                    self.accept(byte, RxState::Function);
                    None
                }
                None => self.resync(byte),
            },
            RxState::Function => match Function::from_code(byte) {
                Some(function @ (Function::Ack | Function::Request(_))) => {
                    self.function = function;
                    self.accept(byte, RxState::SizeHi);
                    None
                }
                _ => self.resync(byte),
            },
            RxState::SizeHi => {
                self.size = (byte as u32) << 16;
                self.accept(byte, RxState::SizeMid);
                None
            }
            RxState::SizeMid => {
                self.size |= (byte as u32) << 8;
                self.accept(byte, RxState::SizeLo);
                None
            }
            RxState::SizeLo => {
                self.size |= byte as u32;
                self.accept(byte, RxState::HeaderCheckHi);
                // The header checksum covers sentinel..size only
                self.expected_check = self.header_sum.take().map_or(0, |sum| sum.value());
                None
            }
            RxState::HeaderCheckHi => {
                if byte == (self.expected_check >> 8) as u8 {
                    self.accept(byte, RxState::HeaderCheckLo);
                    None
                } else {
                    self.resync(byte)
                }
            }
            RxState::HeaderCheckLo => {
                if byte == self.expected_check as u8 {
                    self.header_complete()
                } else {
                    self.resync(byte)
                }
            }
            RxState::Payload => {
                self.buffer[self.data_len] = byte;
                self.data_len += 1;
                self.payload_sum.update(byte);
                if self.data_len == self.expected_len {
                    self.received_check = 0;
                    self.check_len = 0;
                    self.state = RxState::PayloadCheck;
                }
                None
            }
            RxState::PayloadCheck => {
                self.received_check = (self.received_check << 8) | byte as u32;
                self.check_len += 1;
                if self.check_len < TRAILER_LEN {
                    return None;
                }
                let header = Header::new(self.cyclic, self.function, self.size);
                self.reset();
                match self.function {
                    Function::Request(request) if self.received_check == self.payload_sum.value() => {
                        Some(Event::Request(header, request))
                    }
                    _ => {
                        debug!(
                            received = format_args!("{:08X}", self.received_check),
                            computed = format_args!("{:08X}", self.payload_sum.value()),
                            "payload checksum mismatch"
                        );
                        Some(Event::Corrupt(header))
                    }
                }
            }
        }
    }

    /// Give up on a frame that stopped arriving part way through.
    pub fn expire(&mut self) {
        match self.phase() {
            Phase::Idle => {}
            Phase::Header => {
                trace!(bytes = self.pending_len, "header abandoned");
                self.released.extend(&self.pending[..self.pending_len]);
                self.reset();
            }
            Phase::Payload => {
                debug!(received = self.data_len, expected = self.expected_len, "payload abandoned");
                self.data_len = 0;
                self.reset();
            }
        }
    }

    fn accept(&mut self, byte: u8, next: RxState) {
        if let Some(sum) = self.header_sum.as_mut() {
            sum.update(byte);
        }
        self.pending[self.pending_len] = byte;
        self.pending_len += 1;
        self.state = next;
    }

    fn reset(&mut self) {
        self.state = RxState::Idle;
        self.header_sum = None;
        self.pending_len = 0;
    }

    /// Drop the tentative header and rescan what it had consumed.
    fn resync(&mut self, byte: u8) -> Option<Event> {
        let mut replay = [0u8; HEADER_LEN];
        let count = self.pending_len - 1;
        replay[..count].copy_from_slice(&self.pending[1..self.pending_len]);
        replay[count] = byte;

        self.released.push_back(self.pending[0]);
        self.reset();

        let mut event = None;
        for &b in &replay[..=count] {
            if let Some(e) = self.feed(b) {
                event = Some(e);
            }
        }
        event
    }

    fn header_complete(&mut self) -> Option<Event> {
        let header = Header::new(self.cyclic, self.function, self.size);
        self.reset();
        self.data_len = 0;

        match self.function {
            Function::Ack => Some(Event::Ping(header)),
            Function::Request(request) if !request.accepts_size(self.size) => {
                debug!(?request, size = self.size, "request size out of range, dropped");
                None
            }
            Function::Request(request) if request.is_buffered() => {
                self.expected_len = header.data_len();
                self.payload_sum = Adler32::new();
                self.state = RxState::Payload;
                None
            }
            Function::Request(request) => Some(Event::Request(header, request)),
            Function::Nak | Function::Reply(_) => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(cyclic: u8, request: Request, data: &[u8]) -> Vec<u8> {
        encode_frame(Direction::Request, cyclic, Function::Request(request), data)
    }

    fn feed_all(recognizer: &mut Recognizer, bytes: &[u8]) -> Vec<Event> {
        bytes.iter().filter_map(|&b| recognizer.feed(b)).collect()
    }

    fn released(recognizer: &mut Recognizer) -> Vec<u8> {
        std::iter::from_fn(|| recognizer.take_released()).collect()
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut recognizer = Recognizer::new();
        assert!(feed_all(&mut recognizer, b"hello world").is_empty());
        assert_eq!(released(&mut recognizer), b"hello world");
        assert_eq!(recognizer.phase(), Phase::Idle);
    }

    #[test]
    fn test_format_request_recognized() {
        let mut recognizer = Recognizer::new();
        let frame = request(7, Request::Format, &[]);
        let events = feed_all(&mut recognizer, &frame);
        assert_eq!(
            events,
            vec![Event::Request(Header::new(7, Function::Request(Request::Format), 0), Request::Format)]
        );
        assert!(released(&mut recognizer).is_empty());
    }

    #[test]
    fn test_small_payload_buffered() {
        let mut recognizer = Recognizer::new();
        let frame = request(1, Request::SetTime, &[15, 6, 5, 10, 30, 0]);
        let events = feed_all(&mut recognizer, &frame[..HEADER_LEN]);
        assert!(events.is_empty());
        assert_eq!(recognizer.phase(), Phase::Payload);

        let events = feed_all(&mut recognizer, &frame[HEADER_LEN..]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Request(_, Request::SetTime)));
        assert_eq!(recognizer.payload(), &[15, 6, 5, 10, 30, 0]);
        assert_eq!(recognizer.phase(), Phase::Idle);
    }

    #[test]
    fn test_corrupt_payload_reported() {
        let mut recognizer = Recognizer::new();
        let mut frame = request(1, Request::List, &[0x03]);
        frame[HEADER_LEN] ^= 0x01;
        let events = feed_all(&mut recognizer, &frame);
        assert_eq!(events, vec![Event::Corrupt(Header::new(1, Function::Request(Request::List), 5))]);
    }

    #[test]
    fn test_wrong_size_silently_dropped() {
        let mut recognizer = Recognizer::new();
        // A SetTime declaring 8 bytes instead of 10
        let header = Header::new(2, Function::Request(Request::SetTime), 8).encode(Direction::Request);
        assert!(feed_all(&mut recognizer, &header).is_empty());
        assert_eq!(recognizer.phase(), Phase::Idle);

        let frame = request(3, Request::Format, &[]);
        assert_eq!(feed_all(&mut recognizer, &frame).len(), 1);
    }

    #[test]
    fn test_file_minimum_size_boundary() {
        let mut recognizer = Recognizer::new();
        let at_min = Header::new(0, Function::Request(Request::File), FILE_MIN_SIZE).encode(Direction::Request);
        assert_eq!(feed_all(&mut recognizer, &at_min).len(), 1);

        let below = Header::new(0, Function::Request(Request::File), FILE_MIN_SIZE - 1).encode(Direction::Request);
        assert!(feed_all(&mut recognizer, &below).is_empty());
        assert_eq!(recognizer.phase(), Phase::Idle);
    }

    #[test]
    fn test_reply_direction_ignored() {
        let mut recognizer = Recognizer::new();
        let echo = encode_frame(Direction::Reply, 0, Function::Request(Request::Format), &[]);
        assert!(feed_all(&mut recognizer, &echo).is_empty());
        assert_eq!(released(&mut recognizer), echo);
    }

    #[test]
    fn test_ping_event() {
        let mut recognizer = Recognizer::new();
        let ping = Header::new(4, Function::Ack, ack_option(500)).encode(Direction::Request);
        assert_eq!(
            feed_all(&mut recognizer, &ping),
            vec![Event::Ping(Header::new(4, Function::Ack, ack_option(500)))]
        );
    }

    #[test]
    fn test_resync_on_sentinel_inside_failed_header() {
        let mut recognizer = Recognizer::new();
        let frame = request(5, Request::Format, &[]);
        // A stray STX followed by the real frame: the real STX lands in the
        // cyclic-number slot and must be rescanned.
        let mut stream = vec![STX];
        stream.extend_from_slice(&frame);
        let events = feed_all(&mut recognizer, &stream);
        assert_eq!(events.len(), 1);
        assert_eq!(released(&mut recognizer), vec![STX]);
    }

    #[test]
    fn test_truncated_header_then_valid_frame() {
        let mut recognizer = Recognizer::new();
        let frame = request(9, Request::Format, &[]);
        let mut stream = frame[..5].to_vec();
        stream.extend_from_slice(&frame);
        let events = feed_all(&mut recognizer, &stream);
        assert_eq!(events.len(), 1);
        assert_eq!(released(&mut recognizer), frame[..5].to_vec());
    }

    #[test]
    fn test_expire_releases_partial_header() {
        let mut recognizer = Recognizer::new();
        feed_all(&mut recognizer, &[b'x', STX, 0x21]);
        assert_eq!(recognizer.phase(), Phase::Header);
        recognizer.expire();
        assert_eq!(recognizer.phase(), Phase::Idle);
        assert_eq!(released(&mut recognizer), vec![b'x', STX, 0x21]);
    }

    #[test]
    fn test_expire_drops_partial_payload() {
        let mut recognizer = Recognizer::new();
        let frame = request(1, Request::SetTime, &[15, 6, 5, 10, 30, 0]);
        feed_all(&mut recognizer, &frame[..HEADER_LEN + 3]);
        recognizer.expire();
        assert_eq!(recognizer.phase(), Phase::Idle);
        assert!(released(&mut recognizer).is_empty());
        assert_eq!(feed_all(&mut recognizer, &frame).len(), 1);
    }

    proptest! {
        /// Any single corrupted header byte yields no event, and a valid frame
        /// right behind it is still recognized.
        #[test]
        fn corrupted_header_never_blocks_next_frame(
            cyclic in 0u8..=31,
            position in 0usize..HEADER_LEN,
            flip in 1u8..=255,
        ) {
            let mut recognizer = Recognizer::new();
            let mut bad = request(cyclic, Request::Format, &[]);
            bad[position] ^= flip;
            let good = request((cyclic + 1) & CYCLIC_MAX, Request::Format, &[]);

            let mut stream = bad.clone();
            stream.extend_from_slice(&good);
            let events = feed_all(&mut recognizer, &stream);

            // The corrupted frame may never produce an event of its own
            let expected = Event::Request(
                Header::new((cyclic + 1) & CYCLIC_MAX, Function::Request(Request::Format), 0),
                Request::Format,
            );
            prop_assert_eq!(events.last().copied(), Some(expected));
            prop_assert!(events.iter().all(|e| *e == expected));
            prop_assert_eq!(recognizer.phase(), Phase::Idle);
        }

        /// Arbitrary traffic without sentinels comes back out unchanged.
        #[test]
        fn sentinel_free_traffic_is_transparent(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let data: Vec<u8> = data.into_iter().filter(|&b| b != STX).collect();
            let mut recognizer = Recognizer::new();
            prop_assert!(feed_all(&mut recognizer, &data).is_empty());
            prop_assert_eq!(released(&mut recognizer), data);
        }
    }
}
