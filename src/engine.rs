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

//! The Slave side of the protocol
//!
//! `Engine` owns all protocol state. Bytes go in one at a time through
//! `process_byte`/`get_data`, or `poll` reads them from the serial port
//! itself. A File request switches the engine into `Status::Transfer`,
//! during which the payload is read straight from the serial port.

use std::time::{Duration, Instant};
use tracing::{debug, warn};
use crate::clock::Clock;
use crate::commands;
use crate::protocol::*;
use crate::receiver::{ReceiveError, ReceiveMode, ReceiverFsm, ReceiverState};
use crate::recognizer::{Event, Phase, Recognizer};
use crate::response::{self, Responder};
use crate::retransmit::{RequestKey, RetransmitTracker};
use crate::serial::{is_timeout, SerialPort};
use crate::storage::{Storage, TEMP_NAME};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum EngineError {
    Io(std::io::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err)
    }
}

// ============================================================================
// Configuration & Status
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Longest gap allowed between bytes of a File payload
    pub read_timeout: Duration,
    /// How long `poll` waits for a byte
    pub poll_timeout: Duration,
    /// Idle time after which a partly received frame is abandoned
    pub frame_timeout: Duration,
    /// How long a completed request can still be answered as a retransmission
    pub retransmit_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            read_timeout: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(10),
            frame_timeout: Duration::from_secs(1),
            // A Master's reply timeout times its attempts
            retransmit_window: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    /// Checking a possible header
    Header,
    /// Collecting a small request's payload
    Payload,
    /// Receiving a file
    Transfer,
}

struct Transfer {
    fsm: Box<dyn ReceiverState>,
    key: RequestKey,
    /// Cached reply when the File is a retransmission
    replay: Option<Vec<u8>>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    serial: Box<dyn SerialPort>,
    storage: Box<dyn Storage>,
    clock: Box<dyn Clock>,
    config: EngineConfig,
    recognizer: Recognizer,
    tracker: RetransmitTracker,
    transfer: Option<Transfer>,
    last_byte: Instant,
}

impl Engine {
    pub fn new(
        serial: Box<dyn SerialPort>,
        storage: Box<dyn Storage>,
        clock: Box<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Engine {
            serial,
            storage,
            clock,
            config,
            recognizer: Recognizer::new(),
            tracker: RetransmitTracker::new(config.retransmit_window),
            transfer: None,
            last_byte: Instant::now(),
        }
    }

    pub fn status(&self) -> Status {
        if self.transfer.is_some() {
            return Status::Transfer;
        }
        match self.recognizer.phase() {
            Phase::Idle => Status::Idle,
            Phase::Header => Status::Header,
            Phase::Payload => Status::Payload,
        }
    }

    /// Whether protocol traffic is in progress. A conservative check only
    /// counts frames whose header has validated; otherwise a sentinel that
    /// is still being checked counts too.
    pub fn protocol_active(&self, conservative: bool) -> bool {
        match self.status() {
            Status::Idle => false,
            Status::Header => !conservative,
            Status::Payload | Status::Transfer => true,
        }
    }

    /// Feed one byte received from the serial port.
    ///
    /// A File payload is read from the serial port directly, so bytes given
    /// here must come from that same port.
    pub fn process_byte(&mut self, byte: u8) -> Result<(), EngineError> {
        self.run_transfer()?;
        self.last_byte = Instant::now();

        match self.recognizer.feed(byte) {
            None => Ok(()),
            Some(Event::Ping(header)) => self.ping(header),
            Some(Event::Corrupt(header)) => {
                // Context is left alone so a retransmission is executed
                Responder::new(self.serial.as_mut(), header.cyclic).nak(NakCode::Checksum)?;
                Ok(())
            }
            Some(Event::Request(header, request)) => self.dispatch(header, request),
        }
    }

    /// Process `byte` and hand back the next byte of ordinary traffic, if any.
    pub fn get_data(&mut self, byte: u8) -> Result<Option<u8>, EngineError> {
        self.process_byte(byte)?;
        Ok(self.recognizer.take_released())
    }

    /// Next byte of ordinary traffic not yet handed out.
    pub fn take_data(&mut self) -> Option<u8> {
        self.recognizer.take_released()
    }

    /// One turn of the host loop: advance a transfer by one step, or read and
    /// process at most one byte from the serial port.
    pub fn poll(&mut self) -> Result<Status, EngineError> {
        if self.transfer.is_some() {
            self.step_transfer()?;
            return Ok(self.status());
        }

        let mut buf = [0u8; 1];
        match self.serial.read_timeout(&mut buf, self.config.poll_timeout) {
            Ok(0) => {}
            Ok(_) => self.process_byte(buf[0])?,
            Err(e) if is_timeout(&e) => self.check_frame_timeout(),
            Err(e) => return Err(e.into()),
        }
        Ok(self.status())
    }

    /// Finish any file transfer in progress.
    pub fn run_transfer(&mut self) -> Result<(), EngineError> {
        while self.transfer.is_some() {
            self.step_transfer()?;
        }
        Ok(())
    }

    fn check_frame_timeout(&mut self) {
        if self.recognizer.phase() != Phase::Idle && self.last_byte.elapsed() >= self.config.frame_timeout {
            debug!("frame timed out");
            self.recognizer.expire();
        }
    }

    fn ping(&mut self, header: Header) -> Result<(), EngineError> {
        if ack_timeout(header.size).is_none() {
            debug!(option = format_args!("{:06X}", header.size), "ignoring ACK with bad filler");
            return Ok(());
        }
        Responder::new(self.serial.as_mut(), header.cyclic).echo(header.size)?;
        Ok(())
    }

    fn dispatch(&mut self, header: Header, request: Request) -> Result<(), EngineError> {
        debug!(cyclic = header.cyclic, ?request, size = header.size, "<- request");
        let key = RequestKey::new(&header, request);
        let replay = self.tracker.replay_for(&key).map(<[u8]>::to_vec);

        if request != Request::File {
            if let Some(frame) = replay.as_deref() {
                debug!(cyclic = header.cyclic, ?request, "retransmission, replaying reply");
                response::replay(self.serial.as_mut(), frame)?;
                return Ok(());
            }
        }

        let mut responder = Responder::new(self.serial.as_mut(), header.cyclic);
        let payload = self.recognizer.payload();
        match request {
            Request::SetTime => commands::set_time(&mut responder, self.clock.as_mut(), payload)?,
            Request::Format => commands::format(&mut responder, self.storage.as_mut())?,
            Request::List => commands::list(&mut responder, self.storage.as_mut(), payload)?,
            Request::Remove => commands::remove(&mut responder, self.storage.as_mut(), payload)?,
            Request::Rename => commands::rename(&mut responder, self.storage.as_mut(), payload)?,
            Request::File => {
                let mode = if replay.is_some() { ReceiveMode::Verify } else { ReceiveMode::Store };
                let fsm = ReceiverFsm::new(header.size, mode, self.config.read_timeout);
                self.transfer = Some(Transfer { fsm, key, replay });
                return Ok(());
            }
        }
        self.tracker.complete(key, responder.into_record());
        Ok(())
    }

    fn step_transfer(&mut self) -> Result<(), EngineError> {
        let Some(Transfer { fsm, key, replay }) = self.transfer.take() else {
            return Ok(());
        };
        match fsm.step(self.serial.as_mut(), self.storage.as_mut()) {
            Ok(next) => {
                self.transfer = Some(Transfer { fsm: next, key, replay });
                Ok(())
            }
            Err(outcome) => self.finish_transfer(key, replay, outcome),
        }
    }

    fn finish_transfer(&mut self, key: RequestKey, replay: Option<Vec<u8>>, outcome: ReceiveError) -> Result<(), EngineError> {
        if !matches!(outcome, ReceiveError::TransferComplete) {
            self.discard_temp();
        }

        match outcome {
            ReceiveError::TransferComplete => match replay {
                Some(frame) => {
                    debug!(cyclic = key.cyclic, "retransmitted file verified, replaying reply");
                    response::replay(self.serial.as_mut(), &frame)?;
                }
                None => {
                    let mut responder = Responder::new(self.serial.as_mut(), key.cyclic);
                    commands::reply_space(&mut responder, self.storage.as_ref(), Reply::Received)?;
                    self.tracker.complete(key, responder.into_record());
                }
            },
            ReceiveError::Rejected(code) => {
                Responder::new(self.serial.as_mut(), key.cyclic).nak(code)?;
            }
            ReceiveError::Failed(code) => {
                let mut responder = Responder::new(self.serial.as_mut(), key.cyclic);
                responder.nak(code)?;
                self.tracker.complete(key, responder.into_record());
            }
            ReceiveError::Io(e) => return Err(EngineError::Io(e)),
        }
        Ok(())
    }

    fn discard_temp(&mut self) {
        if self.storage.exists(TEMP_NAME) {
            if let Err(e) = self.storage.remove(TEMP_NAME) {
                warn!("cannot delete temporary file: {}", e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
