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

//! Wire constants, function codes and header encoding

use chrono::{NaiveDate, NaiveDateTime};
use crate::checksum::{Adler32, Fletcher16};

/// Start of text - first byte of every frame
pub const STX: u8 = 0x02;

/// Acknowledge - request accepted, option carries the reply timeout
pub const ACK: u8 = 0x06;

/// Negative acknowledge - option carries the error code
pub const NAK: u8 = 0x15;

/// Low byte of every ACK option
pub const ACK_FILLER: u8 = 0x5A;

/// Low 16 bits of every NAK option
pub const NAK_FILLER: u16 = 0xA55A;

/// Cyclic numbers run 0..=31
pub const CYCLIC_MAX: u8 = 31;

/// Added to the cyclic number on frames sent by the Master
pub const REQUEST_CYCLIC_OFFSET: u8 = 0x20;

/// Added to the cyclic number on frames sent by the Slave
pub const REPLY_CYCLIC_OFFSET: u8 = 0x40;

pub const HEADER_LEN: usize = 8;

/// Trailing Adler-32 after every payload
pub const TRAILER_LEN: usize = 4;

/// Largest value of the 24-bit size field
pub const MAX_SIZE: u32 = 0x00FF_FFFF;

/// Capacity of the buffer holding non-streamed request payloads
pub const SMALL_BUFFER_CAPACITY: usize = 70;

pub const TIMESTAMP_LEN: usize = 6;

/// Year encoded as offset zero in a timestamp
pub const EPOCH_YEAR: i32 = 2019;

/// Smallest File payload: one-character name, timestamp, no data, trailer
pub const FILE_MIN_SIZE: u32 = (1 + 1 + TIMESTAMP_LEN + TRAILER_LEN) as u32;

/// Longest ACK timeout that fits the option field
pub const ACK_TIMEOUT_MAX_MS: u32 = 0x1_0000;

// ============================================================================
// Function Codes
// ============================================================================

/// Commands sent by the Master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    SetTime,
    Format,
    List,
    Remove,
    Rename,
    File,
}

/// Successful replies sent by the Slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reply {
    TimeSet,
    Formatted,
    Listing,
    Removed,
    Renamed,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Ack,
    Nak,
    Request(Request),
    Reply(Reply),
}

impl Request {
    pub fn code(self) -> u8 {
        match self {
            Request::SetTime => 0x60,
            Request::Format => 0x61,
            Request::List => 0x62,
            Request::Remove => 0x63,
            Request::Rename => 0x64,
            Request::File => 0x65,
        }
    }

    pub fn from_code(code: u8) -> Option<Request> {
        match code {
            0x60 => Some(Request::SetTime),
            0x61 => Some(Request::Format),
            0x62 => Some(Request::List),
            0x63 => Some(Request::Remove),
            0x64 => Some(Request::Rename),
            0x65 => Some(Request::File),
            _ => None,
        }
    }

    pub fn reply(self) -> Reply {
        match self {
            Request::SetTime => Reply::TimeSet,
            Request::Format => Reply::Formatted,
            Request::List => Reply::Listing,
            Request::Remove => Reply::Removed,
            Request::Rename => Reply::Renamed,
            Request::File => Reply::Received,
        }
    }

    /// Requests whose payload is collected in the small-message buffer
    pub fn is_buffered(self) -> bool {
        matches!(self, Request::SetTime | Request::List | Request::Remove | Request::Rename)
    }

    /// Requests that may be executed again on a retransmission
    pub fn is_idempotent(self) -> bool {
        matches!(self, Request::List)
    }

    /// Whether a header declaring `size` is a well-formed instance of this request.
    pub fn accepts_size(self, size: u32) -> bool {
        let trailer = TRAILER_LEN as u32;
        let capacity = SMALL_BUFFER_CAPACITY as u32 + trailer;
        match self {
            Request::SetTime => size == TIMESTAMP_LEN as u32 + trailer,
            Request::Format => size == 0,
            Request::List => size == 1 + trailer,
            Request::Remove => (2 + trailer..=capacity).contains(&size),
            Request::Rename => (4 + trailer..=capacity).contains(&size),
            Request::File => size >= FILE_MIN_SIZE,
        }
    }
}

impl Reply {
    pub fn code(self) -> u8 {
        match self {
            Reply::TimeSet => 0x70,
            Reply::Formatted => 0x71,
            Reply::Listing => 0x72,
            Reply::Removed => 0x73,
            Reply::Renamed => 0x74,
            Reply::Received => 0x75,
        }
    }

    pub fn from_code(code: u8) -> Option<Reply> {
        match code {
            0x70 => Some(Reply::TimeSet),
            0x71 => Some(Reply::Formatted),
            0x72 => Some(Reply::Listing),
            0x73 => Some(Reply::Removed),
            0x74 => Some(Reply::Renamed),
            0x75 => Some(Reply::Received),
            _ => None,
        }
    }
}

impl Function {
    pub fn code(self) -> u8 {
        match self {
            Function::Ack => ACK,
            Function::Nak => NAK,
            Function::Request(request) => request.code(),
            Function::Reply(reply) => reply.code(),
        }
    }

    pub fn from_code(code: u8) -> Option<Function> {
        match code {
            ACK => Some(Function::Ack),
            NAK => Some(Function::Nak),
            _ => Request::from_code(code)
                .map(Function::Request)
                .or_else(|| Reply::from_code(code).map(Function::Reply)),
        }
    }

    /// ACK and NAK carry an option in the size field instead of a payload.
    pub fn has_option(self) -> bool {
        matches!(self, Function::Ack | Function::Nak)
    }
}

// ============================================================================
// NAK Codes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NakCode {
    Timeout,
    Checksum,
    Format,
    FsError,
    NotFound,
    BadName,
    BadSize,
    Exists,
}

impl NakCode {
    pub fn code(self) -> u8 {
        match self {
            NakCode::Timeout => 0x21,
            NakCode::Checksum => 0x22,
            NakCode::Format => 0x23,
            NakCode::FsError => 0x24,
            NakCode::NotFound => 0x25,
            NakCode::BadName => 0x26,
            NakCode::BadSize => 0x27,
            NakCode::Exists => 0x28,
        }
    }

    pub fn from_code(code: u8) -> Option<NakCode> {
        match code {
            0x21 => Some(NakCode::Timeout),
            0x22 => Some(NakCode::Checksum),
            0x23 => Some(NakCode::Format),
            0x24 => Some(NakCode::FsError),
            0x25 => Some(NakCode::NotFound),
            0x26 => Some(NakCode::BadName),
            0x27 => Some(NakCode::BadSize),
            0x28 => Some(NakCode::Exists),
            _ => None,
        }
    }
}

impl std::fmt::Display for NakCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NakCode::Timeout => "timeout",
            NakCode::Checksum => "checksum mismatch",
            NakCode::Format => "bad message format",
            NakCode::FsError => "file system error",
            NakCode::NotFound => "file not found",
            NakCode::BadName => "bad file name",
            NakCode::BadSize => "bad file size",
            NakCode::Exists => "file exists",
        };
        write!(f, "{} (0x{:02X})", text, self.code())
    }
}

// ============================================================================
// Options
// ============================================================================

/// Pack a reply timeout in milliseconds into an ACK option.
pub fn ack_option(timeout_ms: u32) -> u32 {
    let timeout_ms = timeout_ms.clamp(1, ACK_TIMEOUT_MAX_MS);
    ((timeout_ms - 1) << 8) | ACK_FILLER as u32
}

/// Timeout carried by an ACK option, or None if the filler is wrong.
pub fn ack_timeout(option: u32) -> Option<u32> {
    if option & 0xFF != ACK_FILLER as u32 {
        return None;
    }
    Some(((option >> 8) & 0xFFFF) + 1)
}

pub fn nak_option(code: NakCode) -> u32 {
    ((code.code() as u32) << 16) | NAK_FILLER as u32
}

pub fn nak_code(option: u32) -> Option<NakCode> {
    if option & 0xFFFF != NAK_FILLER as u32 {
        return None;
    }
    NakCode::from_code((option >> 16) as u8)
}

// ============================================================================
// Header
// ============================================================================

/// Which side sent a frame; decides the cyclic byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Reply,
}

impl Direction {
    pub fn cyclic_offset(self) -> u8 {
        match self {
            Direction::Request => REQUEST_CYCLIC_OFFSET,
            Direction::Reply => REPLY_CYCLIC_OFFSET,
        }
    }

    /// Cyclic number encoded by `byte`, if it is in range for this direction.
    pub fn decode_cyclic(self, byte: u8) -> Option<u8> {
        byte.checked_sub(self.cyclic_offset()).filter(|&cyclic| cyclic <= CYCLIC_MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub cyclic: u8,
    pub function: Function,
    /// Payload size including trailer, or the ACK/NAK option
    pub size: u32,
}

impl Header {
    pub fn new(cyclic: u8, function: Function, size: u32) -> Self {
        Header { cyclic: cyclic & CYCLIC_MAX, function, size: size & MAX_SIZE }
    }

    pub fn encode(&self, direction: Direction) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = STX;
        bytes[1] = self.cyclic + direction.cyclic_offset();
        bytes[2] = self.function.code();
        bytes[3] = (self.size >> 16) as u8;
        bytes[4] = (self.size >> 8) as u8;
        bytes[5] = self.size as u8;
        let checksum = Fletcher16::checksum(&bytes[..6]);
        bytes[6] = (checksum >> 8) as u8;
        bytes[7] = checksum as u8;
        bytes
    }

    /// Length of the payload data, not counting the trailer.
    pub fn data_len(&self) -> usize {
        if self.function.has_option() {
            0
        } else {
            (self.size as usize).saturating_sub(TRAILER_LEN)
        }
    }
}

/// Encode a complete frame. Non-empty `data` is followed by its Adler-32.
pub fn encode_frame(direction: Direction, cyclic: u8, function: Function, data: &[u8]) -> Vec<u8> {
    let size = if data.is_empty() { 0 } else { (data.len() + TRAILER_LEN) as u32 };
    let mut frame = Vec::with_capacity(HEADER_LEN + data.len() + TRAILER_LEN);
    frame.extend_from_slice(&Header::new(cyclic, function, size).encode(direction));
    if !data.is_empty() {
        frame.extend_from_slice(data);
        frame.extend_from_slice(&Adler32::checksum(data).to_be_bytes());
    }
    frame
}

// ============================================================================
// Timestamp
// ============================================================================

/// Wire timestamp: day, month, year offset, hour, minute, second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub day: u8,
    pub month: u8,
    pub year_offset: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    pub fn from_bytes(bytes: [u8; TIMESTAMP_LEN]) -> Self {
        Timestamp {
            day: bytes[0],
            month: bytes[1],
            year_offset: bytes[2],
            hour: bytes[3],
            minute: bytes[4],
            second: bytes[5],
        }
    }

    pub fn to_bytes(self) -> [u8; TIMESTAMP_LEN] {
        [self.day, self.month, self.year_offset, self.hour, self.minute, self.second]
    }

    /// None for out-of-range fields or dates that do not exist.
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        if !(1..=31).contains(&self.day)
            || !(1..=12).contains(&self.month)
            || self.hour > 23
            || self.minute > 59
            || self.second > 59
        {
            return None;
        }
        NaiveDate::from_ymd_opt(EPOCH_YEAR + self.year_offset as i32, self.month as u32, self.day as u32)?
            .and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
    }

    /// None when the year cannot be expressed as an offset from the epoch year.
    pub fn from_datetime(datetime: &NaiveDateTime) -> Option<Self> {
        use chrono::{Datelike, Timelike};
        let offset = u8::try_from(datetime.year() - EPOCH_YEAR).ok()?;
        Some(Timestamp {
            day: datetime.day() as u8,
            month: datetime.month() as u8,
            year_offset: offset,
            hour: datetime.hour() as u8,
            minute: datetime.minute() as u8,
            second: datetime.second() as u8,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_codes_roundtrip() {
        for code in 0u8..=0xFF {
            if let Some(function) = Function::from_code(code) {
                assert_eq!(function.code(), code);
            }
        }
        assert_eq!(Function::from_code(0x65), Some(Function::Request(Request::File)));
        assert_eq!(Function::from_code(0x74), Some(Function::Reply(Reply::Renamed)));
        assert_eq!(Function::from_code(0x66), None);
    }

    #[test]
    fn test_header_encoding() {
        let header = Header::new(3, Function::Request(Request::Format), 0);
        let bytes = header.encode(Direction::Request);
        assert_eq!(&bytes[..6], &[STX, 0x23, 0x61, 0x00, 0x00, 0x00]);
        let checksum = Fletcher16::checksum(&bytes[..6]);
        assert_eq!(bytes[6], (checksum >> 8) as u8);
        assert_eq!(bytes[7], checksum as u8);

        let reply = header.encode(Direction::Reply);
        assert_eq!(reply[1], 0x43);
    }

    #[test]
    fn test_decode_cyclic_ranges() {
        assert_eq!(Direction::Request.decode_cyclic(0x20), Some(0));
        assert_eq!(Direction::Request.decode_cyclic(0x3F), Some(31));
        assert_eq!(Direction::Request.decode_cyclic(0x40), None);
        assert_eq!(Direction::Request.decode_cyclic(0x1F), None);
        assert_eq!(Direction::Reply.decode_cyclic(0x45), Some(5));
    }

    #[test]
    fn test_ack_option_packing() {
        assert_eq!(ack_option(1000), (999 << 8) | 0x5A);
        assert_eq!(ack_timeout(ack_option(1000)), Some(1000));
        assert_eq!(ack_option(1_000_000), 0xFFFF5A);
        assert_eq!(ack_timeout(0xFFFF5A), Some(65536));
        assert_eq!(ack_option(0), 0x00005A);
        assert_eq!(ack_timeout(0x123456), None);
    }

    #[test]
    fn test_nak_option_packing() {
        assert_eq!(nak_option(NakCode::NotFound), 0x25A55A);
        assert_eq!(nak_code(0x25A55A), Some(NakCode::NotFound));
        assert_eq!(nak_code(0x25A55B), None);
        assert_eq!(nak_code(0x99A55A), None);
    }

    #[test]
    fn test_request_size_ranges() {
        assert!(Request::SetTime.accepts_size(10));
        assert!(!Request::SetTime.accepts_size(8));
        assert!(Request::Format.accepts_size(0));
        assert!(!Request::Format.accepts_size(4));
        assert!(Request::List.accepts_size(5));
        assert!(Request::Remove.accepts_size(6));
        assert!(!Request::Remove.accepts_size(5));
        assert!(Request::Remove.accepts_size(74));
        assert!(!Request::Remove.accepts_size(75));
        assert!(Request::Rename.accepts_size(8));
        assert!(!Request::Rename.accepts_size(7));
        assert!(Request::File.accepts_size(FILE_MIN_SIZE));
        assert!(!Request::File.accepts_size(FILE_MIN_SIZE - 1));
    }

    #[test]
    fn test_encode_frame_appends_trailer() {
        let frame = encode_frame(Direction::Reply, 1, Function::Reply(Reply::Removed), &[1, 2, 3]);
        assert_eq!(frame.len(), HEADER_LEN + 3 + TRAILER_LEN);
        assert_eq!(&frame[3..6], &[0, 0, 7]);
        assert_eq!(&frame[11..], &Adler32::checksum(&[1, 2, 3]).to_be_bytes());

        let empty = encode_frame(Direction::Reply, 1, Function::Reply(Reply::TimeSet), &[]);
        assert_eq!(empty.len(), HEADER_LEN);
    }

    #[test]
    fn test_timestamp_conversion() {
        let stamp = Timestamp::from_bytes([15, 6, 5, 10, 30, 0]);
        let datetime = stamp.to_datetime().expect("valid timestamp");
        assert_eq!(datetime.to_string(), "2024-06-15 10:30:00");
        assert_eq!(Timestamp::from_datetime(&datetime), Some(stamp));

        assert_eq!(Timestamp::from_bytes([31, 2, 5, 0, 0, 0]).to_datetime(), None);
        assert_eq!(Timestamp::from_bytes([0, 1, 0, 0, 0, 0]).to_datetime(), None);
        assert_eq!(Timestamp::from_bytes([1, 1, 0, 24, 0, 0]).to_datetime(), None);
        assert_eq!(Timestamp::default().to_datetime(), None);

        let before_epoch = NaiveDate::from_ymd_opt(2018, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(Timestamp::from_datetime(&before_epoch), None);
    }
}
