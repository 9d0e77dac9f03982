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

//! Streamed receive of a File payload
//!
//! Data goes to the temporary file as it arrives. The destination is only
//! touched once every byte has been received and the trailer matched.

use std::marker::PhantomData;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::checksum::Adler32;
use crate::protocol::*;
use crate::serial::SerialPort;
use crate::storage::{validate_name, Storage, TEMP_NAME};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum ReceiveError {
    /// Transport failure other than a timeout
    Io(std::io::Error),
    /// Refused before the payload was verified
    Rejected(NakCode),
    /// Refused after the payload was received and verified
    Failed(NakCode),
    TransferComplete,
}

impl std::fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveError::Io(e) => write!(f, "I/O error: {}", e),
            ReceiveError::Rejected(code) => write!(f, "Transfer rejected: {}", code),
            ReceiveError::Failed(code) => write!(f, "Transfer failed: {}", code),
            ReceiveError::TransferComplete => write!(f, "Transfer complete"),
        }
    }
}

impl std::error::Error for ReceiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReceiveError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReceiveError {
    fn from(err: std::io::Error) -> Self {
        ReceiveError::Io(err)
    }
}

// ============================================================================
// States
// ============================================================================

pub struct ReadNameLength;
pub struct ReadNameAndDate;
pub struct ReceiveData;
pub struct VerifyChecksum;
pub struct Commit;
/// Swallow the rest of a refused payload, then NAK
pub struct Drain;

/// What to do with a payload that passes its checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Stage in the temporary file and promote it
    Store,
    /// Check it only; storage is not touched
    Verify,
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    mode: ReceiveMode,
    read_timeout: Duration,
    /// Declared bytes still on the wire, trailer included
    remaining: usize,
    name_len: usize,
    max_name_length: u8,
    page_size: usize,
    header: Vec<u8>,
    temp: Option<Box<dyn Write + Send>>,
    chunk: Vec<u8>,
    checksum: Adler32,
    refusal: NakCode,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(
        self: Box<Self>,
        serial: &mut dyn SerialPort,
        storage: &mut dyn Storage,
    ) -> Result<Box<dyn ReceiverState>, ReceiveError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            mode: self.mode,
            read_timeout: self.read_timeout,
            remaining: self.remaining,
            name_len: self.name_len,
            max_name_length: self.max_name_length,
            page_size: self.page_size,
            header: self.header,
            temp: self.temp,
            chunk: self.chunk,
            checksum: self.checksum,
            refusal: self.refusal,
        })
    }

    fn io_error(&self, e: std::io::Error) -> ReceiveError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        ReceiveError::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    /// Read exactly `buf.len()` bytes or report the line went quiet.
    fn read_all(&mut self, serial: &mut dyn SerialPort, buf: &mut [u8]) -> Result<(), ReceiveError> {
        match serial.read_exact_timeout(buf, self.read_timeout) {
            Ok(n) => {
                self.remaining -= n;
                if n < buf.len() {
                    debug!(wanted = buf.len(), got = n, "file payload stalled");
                    Err(ReceiveError::Rejected(NakCode::Timeout))
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Give up on the payload; what is left of it is read and dropped first.
    fn refuse(mut self, code: NakCode) -> Box<dyn ReceiverState> {
        debug!(%code, remaining = self.remaining, "refusing file");
        self.refusal = code;
        self.temp = None;
        self.transition::<Drain>()
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<ReadNameLength> {
    fn step(self: Box<Self>, serial: &mut dyn SerialPort, storage: &mut dyn Storage) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        let mut buf = [0u8; 1];
        fsm.read_all(serial, &mut buf)?;
        fsm.name_len = buf[0] as usize;

        match storage.begin().and_then(|_| storage.info()) {
            Ok(fs) => {
                fsm.max_name_length = fs.max_name_length;
                fsm.page_size = fs.page_size.max(1);
            }
            Err(e) => {
                warn!("storage unavailable: {}", e);
                return Ok(fsm.refuse(NakCode::FsError));
            }
        }

        let needed = fsm.name_len + TIMESTAMP_LEN + TRAILER_LEN;
        if fsm.name_len == 0 || fsm.name_len > fsm.max_name_length as usize || needed > fsm.remaining {
            debug!(name_len = fsm.name_len, remaining = fsm.remaining, "bad file name length");
            return Ok(fsm.refuse(NakCode::BadSize));
        }

        let next = fsm.transition::<ReadNameAndDate>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<ReadNameAndDate> {
    fn step(self: Box<Self>, serial: &mut dyn SerialPort, storage: &mut dyn Storage) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        let mut header = vec![0u8; fsm.name_len + TIMESTAMP_LEN];
        fsm.read_all(serial, &mut header)?;
        fsm.header = header;
        debug!(
            name = %String::from_utf8_lossy(&fsm.header[..fsm.name_len]),
            len = fsm.remaining - TRAILER_LEN,
            mode = ?fsm.mode,
            "receiving file"
        );

        if fsm.chunk.try_reserve_exact(fsm.page_size).is_err() {
            warn!(page_size = fsm.page_size, "no memory for receive buffer");
            return Ok(fsm.refuse(NakCode::FsError));
        }
        fsm.chunk.resize(fsm.page_size, 0);

        if fsm.mode == ReceiveMode::Store {
            match storage.create(TEMP_NAME) {
                Ok(file) => fsm.temp = Some(file),
                Err(e) => {
                    warn!("cannot create temporary file: {}", e);
                    return Ok(fsm.refuse(NakCode::FsError));
                }
            }
        }

        let next = fsm.transition::<ReceiveData>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<ReceiveData> {
    fn step(self: Box<Self>, serial: &mut dyn SerialPort, _storage: &mut dyn Storage) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        let data_left = fsm.remaining - TRAILER_LEN;
        if data_left == 0 {
            let next = fsm.transition::<VerifyChecksum>();
            return Ok(next as Box<dyn ReceiverState>);
        }

        let n = data_left.min(fsm.chunk.len());
        let mut chunk = std::mem::take(&mut fsm.chunk);
        let read = fsm.read_all(serial, &mut chunk[..n]);
        if let Err(e) = read {
            fsm.chunk = chunk;
            return Err(e);
        }
        fsm.checksum.update_slice(&chunk[..n]);

        let written = match fsm.temp.as_mut() {
            Some(file) => file.write(&chunk[..n]),
            None => Ok(n),
        };
        fsm.chunk = chunk;
        match written {
            Ok(count) if count == n => Ok(Box::new(fsm) as Box<dyn ReceiverState>),
            Ok(count) => {
                warn!(wanted = n, written = count, "short write to temporary file");
                Ok(fsm.refuse(NakCode::FsError))
            }
            Err(e) => {
                warn!("write to temporary file failed: {}", e);
                Ok(fsm.refuse(NakCode::FsError))
            }
        }
    }
}

impl ReceiverState for ReceiverFsm<VerifyChecksum> {
    fn step(self: Box<Self>, serial: &mut dyn SerialPort, _storage: &mut dyn Storage) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        let mut trailer = [0u8; TRAILER_LEN];
        fsm.read_all(serial, &mut trailer)?;
        let received = u32::from_be_bytes(trailer);
        let computed = fsm.checksum.value();
        if received != computed {
            debug!(
                received = format_args!("{:08X}", received),
                computed = format_args!("{:08X}", computed),
                "file checksum mismatch"
            );
            return Err(ReceiveError::Rejected(NakCode::Checksum));
        }

        if let Some(mut file) = fsm.temp.take() {
            if let Err(e) = file.flush() {
                warn!("flush of temporary file failed: {}", e);
                return Err(ReceiveError::Rejected(NakCode::FsError));
            }
        }

        match fsm.mode {
            ReceiveMode::Verify => Err(ReceiveError::TransferComplete),
            ReceiveMode::Store => {
                let next = fsm.transition::<Commit>();
                Ok(next as Box<dyn ReceiverState>)
            }
        }
    }
}

impl ReceiverState for ReceiverFsm<Commit> {
    fn step(self: Box<Self>, _serial: &mut dyn SerialPort, storage: &mut dyn Storage) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let fsm = *self;

        let (raw_name, raw_stamp) = fsm.header.split_at(fsm.name_len);
        let name = validate_name(raw_name, fsm.max_name_length).map_err(ReceiveError::Failed)?;

        let mut stamp = [0u8; TIMESTAMP_LEN];
        stamp.copy_from_slice(raw_stamp);
        let time = Timestamp::from_bytes(stamp)
            .to_datetime()
            .ok_or(ReceiveError::Failed(NakCode::Format))?;

        if storage.exists(name) {
            if let Err(e) = storage.remove(name) {
                warn!(name, "cannot replace existing file: {}", e);
                return Err(ReceiveError::Failed(NakCode::FsError));
            }
        }
        if let Err(e) = storage.rename(TEMP_NAME, name) {
            warn!(name, "cannot promote temporary file: {}", e);
            return Err(ReceiveError::Failed(NakCode::FsError));
        }
        if let Err(e) = storage.set_timestamp(name, time) {
            warn!(name, "cannot set file time: {}", e);
        }

        info!(name, %time, "file received");
        Err(ReceiveError::TransferComplete)
    }
}

impl ReceiverState for ReceiverFsm<Drain> {
    fn step(self: Box<Self>, serial: &mut dyn SerialPort, _storage: &mut dyn Storage) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        let mut scratch = [0u8; 64];
        let n = fsm.remaining.min(scratch.len());
        if n == 0 {
            return Err(ReceiveError::Rejected(fsm.refusal));
        }
        match fsm.read_all(serial, &mut scratch[..n]) {
            Ok(()) => Ok(Box::new(fsm) as Box<dyn ReceiverState>),
            // The sender stopped early; refuse with the original reason
            Err(ReceiveError::Rejected(_)) => Err(ReceiveError::Rejected(fsm.refusal)),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl ReceiverFsm<ReadNameLength> {
    /// Receiver for a File payload of `size` declared bytes.
    pub fn new(size: u32, mode: ReceiveMode, read_timeout: Duration) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<ReadNameLength>,
            mode,
            read_timeout,
            remaining: size as usize,
            name_len: 0,
            max_name_length: 0,
            page_size: 1,
            header: Vec::new(),
            temp: None,
            chunk: Vec::new(),
            checksum: Adler32::new(),
            refusal: NakCode::FsError,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode the data of a File request: name, timestamp, contents.
pub fn file_payload(name: &str, timestamp: Timestamp, contents: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + name.len() + TIMESTAMP_LEN + contents.len());
    payload.push(name.len() as u8);
    payload.extend_from_slice(name.as_bytes());
    payload.extend_from_slice(&timestamp.to_bytes());
    payload.extend_from_slice(contents);
    payload
}

/// Trailer of a File request, which covers the contents only.
pub fn file_trailer(contents: &[u8]) -> [u8; TRAILER_LEN] {
    Adler32::checksum(contents).to_be_bytes()
}

// ============================================================================
// Tests
// ============================================================================
