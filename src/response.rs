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

use std::io;
use tracing::{debug, trace};
use crate::checksum::Adler32;
use crate::protocol::*;
use crate::serial::SerialPort;

/// Writes the frames answering one request.
///
/// The final reply (a NAK or a complete reply frame) is kept so it can be
/// replayed to a retransmitted request. Intermediate ACKs and streamed
/// replies are not kept.
pub struct Responder<'a> {
    serial: &'a mut dyn SerialPort,
    cyclic: u8,
    record: Vec<u8>,
    stream: Option<Adler32>,
}

impl<'a> Responder<'a> {
    pub fn new(serial: &'a mut dyn SerialPort, cyclic: u8) -> Self {
        Responder { serial, cyclic, record: Vec::new(), stream: None }
    }

    /// Tell the Master the request is accepted and how long the reply may take.
    pub fn ack(&mut self, timeout_ms: u32) -> io::Result<()> {
        let header = Header::new(self.cyclic, Function::Ack, ack_option(timeout_ms));
        debug!(cyclic = self.cyclic, timeout_ms, "-> ACK");
        self.send(&header.encode(Direction::Reply))
    }

    /// Answer a ping with the option it carried.
    pub fn echo(&mut self, option: u32) -> io::Result<()> {
        let header = Header::new(self.cyclic, Function::Ack, option);
        debug!(cyclic = self.cyclic, "-> ACK echo");
        self.send(&header.encode(Direction::Reply))
    }

    pub fn nak(&mut self, code: NakCode) -> io::Result<()> {
        let frame = Header::new(self.cyclic, Function::Nak, nak_option(code)).encode(Direction::Reply);
        debug!(cyclic = self.cyclic, %code, "-> NAK");
        self.record = frame.to_vec();
        self.send(&frame)
    }

    pub fn reply(&mut self, reply: Reply, data: &[u8]) -> io::Result<()> {
        let frame = encode_frame(Direction::Reply, self.cyclic, Function::Reply(reply), data);
        debug!(cyclic = self.cyclic, ?reply, len = data.len(), "-> reply");
        self.send(&frame)?;
        self.record = frame;
        Ok(())
    }

    /// Start a reply whose `data_len` bytes of data follow through `stream`.
    pub fn begin_stream(&mut self, reply: Reply, data_len: usize) -> io::Result<()> {
        let size = data_len + TRAILER_LEN;
        if data_len == 0 || size > MAX_SIZE as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "streamed reply size out of range"));
        }
        let header = Header::new(self.cyclic, Function::Reply(reply), size as u32);
        debug!(cyclic = self.cyclic, ?reply, len = data_len, "-> streamed reply");
        self.stream = Some(Adler32::new());
        self.send(&header.encode(Direction::Reply))
    }

    pub fn stream(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(sum) = self.stream.as_mut() {
            sum.update_slice(data);
        }
        self.send(data)
    }

    pub fn end_stream(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(sum) => self.send(&sum.value().to_be_bytes()),
            None => Ok(()),
        }
    }

    /// The final reply, for the retransmit cache.
    pub fn into_record(self) -> Vec<u8> {
        self.record
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        trace!(tx = %hex::encode(bytes));
        self.serial.write_all(bytes)
    }
}

/// Write a cached reply again.
pub fn replay(serial: &mut dyn SerialPort, frame: &[u8]) -> io::Result<()> {
    debug!(len = frame.len(), "-> replay");
    trace!(tx = %hex::encode(frame));
    serial.write_all(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;

    #[test]
    fn test_nak_is_recorded() {
        let expected = Header::new(3, Function::Nak, nak_option(NakCode::NotFound)).encode(Direction::Reply);
        let mut serial = MockSerialPort::new(vec![], expected.to_vec());
        let mut responder = Responder::new(&mut serial, 3);
        responder.nak(NakCode::NotFound).expect("nak");
        assert_eq!(responder.into_record(), expected.to_vec());
    }

    #[test]
    fn test_ack_not_recorded() {
        let ack = Header::new(1, Function::Ack, ack_option(30_000)).encode(Direction::Reply);
        let reply = encode_frame(Direction::Reply, 1, Function::Reply(Reply::Removed), &[0; 8]);
        let mut expected = ack.to_vec();
        expected.extend_from_slice(&reply);

        let mut serial = MockSerialPort::new(vec![], expected);
        let mut responder = Responder::new(&mut serial, 1);
        responder.ack(30_000).expect("ack");
        responder.reply(Reply::Removed, &[0; 8]).expect("reply");
        assert_eq!(responder.into_record(), reply);
    }

    #[test]
    fn test_streamed_reply_matches_single_frame() {
        let data: Vec<u8> = (0u8..40).collect();
        let expected = encode_frame(Direction::Reply, 9, Function::Reply(Reply::Listing), &data);
        let mut serial = MockSerialPort::new(vec![], expected);
        let mut responder = Responder::new(&mut serial, 9);
        responder.begin_stream(Reply::Listing, data.len()).expect("begin");
        for chunk in data.chunks(7) {
            responder.stream(chunk).expect("stream");
        }
        responder.end_stream().expect("end");
        assert!(responder.into_record().is_empty());
    }

    #[test]
    fn test_stream_rejects_oversized_reply() {
        let mut serial = MockSerialPort::new(vec![], vec![]);
        let mut responder = Responder::new(&mut serial, 0);
        let err = responder.begin_stream(Reply::Listing, MAX_SIZE as usize).expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
