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

use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte pipe shared by protocol frames and ordinary traffic
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Read whatever is available, waiting at most `timeout` for the first byte.
    /// Expiry is reported as `ErrorKind::TimedOut`.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Fill `buf`, allowing `timeout` between bytes. Returns how many bytes
    /// arrived before a gap longer than `timeout`.
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_timeout(&mut buf[filled..], timeout) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

/// True for the error a serial read reports when nothing arrived in time.
pub fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock)
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(50))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        if self.port.timeout() != timeout {
            self.port.set_timeout(timeout)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }
        self.port.read(buf)
    }
}

// ============================================================================
// Scripted serial port for tests
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    /// Scripted input; `None` makes one read time out
    script: std::collections::VecDeque<Option<u8>>,
    scripted: usize,
    written: Vec<u8>,
    expected: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(script: Vec<Option<u8>>, expected: Vec<u8>) -> Self {
        MockSerialPort {
            scripted: script.len(),
            script: script.into(),
            written: Vec::new(),
            expected,
        }
    }

    /// Port whose reads all come from `bytes`, with no timeouts in between.
    pub fn with_input(bytes: &[u8], expected: Vec<u8>) -> Self {
        MockSerialPort::new(bytes.iter().map(|&b| Some(b)).collect(), expected)
    }

    fn timed_out() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "scripted timeout")
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        match self.script.front() {
            None => return Err(Self::timed_out()),
            Some(None) => {
                self.script.pop_front();
                return Err(Self::timed_out());
            }
            Some(Some(_)) => {}
        }

        let mut n = 0;
        while n < buf.len() {
            match self.script.front() {
                Some(Some(byte)) => {
                    buf[n] = *byte;
                    n += 1;
                    self.script.pop_front();
                }
                _ => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert!(
            self.script.is_empty(),
            "{} of {} scripted reads never consumed",
            self.script.len(),
            self.scripted
        );
        assert_eq!(
            hex::encode(&self.written),
            hex::encode(&self.expected),
            "serial output differs from the expected bytes"
        );
    }
}

// ============================================================================
// In-process serial link for end-to-end tests
// ============================================================================

#[cfg(test)]
pub struct PipeSerialPort {
    rx: std::sync::mpsc::Receiver<u8>,
    tx: std::sync::mpsc::Sender<u8>,
}

#[cfg(test)]
impl PipeSerialPort {
    /// Two ends of a null-modem cable.
    pub fn pair() -> (PipeSerialPort, PipeSerialPort) {
        let (a_tx, b_rx) = std::sync::mpsc::channel();
        let (b_tx, a_rx) = std::sync::mpsc::channel();
        (
            PipeSerialPort { rx: a_rx, tx: a_tx },
            PipeSerialPort { rx: b_rx, tx: b_tx },
        )
    }
}

#[cfg(test)]
impl SerialPort for PipeSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for &byte in buf {
            self.tx.send(byte)
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))?;
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        use std::sync::mpsc::RecvTimeoutError;

        if buf.is_empty() {
            return Ok(0);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(byte) => buf[0] = byte,
            Err(RecvTimeoutError::Timeout) => {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "pipe timeout"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"));
            }
        }
        let mut n = 1;
        while n < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        Ok(n)
    }
}

// ============================================================================
// Tests
// ============================================================================
