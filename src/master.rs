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

//! Host side of the protocol

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, trace, warn};
use crate::checksum::{Adler32, Fletcher16};
use crate::message::*;
use crate::protocol::*;
use crate::receiver::{file_payload, file_trailer};
use crate::serial::{is_timeout, SerialPort};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum MasterError {
    Io(std::io::Error),
    /// No reply before the deadline, after every retry
    Timeout,
    /// The Slave refused the request
    Nak(NakCode),
    UnexpectedReply(Function),
    /// A reply failed its trailer on every attempt, or could not be decoded
    Corrupt,
    InvalidArgument(String),
}

impl std::fmt::Display for MasterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterError::Io(e) => write!(f, "I/O error: {}", e),
            MasterError::Timeout => write!(f, "No reply from device"),
            MasterError::Nak(code) => write!(f, "Device refused request: {}", code),
            MasterError::UnexpectedReply(function) => write!(f, "Unexpected reply 0x{:02X}", function.code()),
            MasterError::Corrupt => write!(f, "Corrupt reply"),
            MasterError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for MasterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MasterError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MasterError {
    fn from(err: std::io::Error) -> Self {
        MasterError::Io(err)
    }
}

impl From<CursorError> for MasterError {
    fn from(err: CursorError) -> Self {
        debug!("undecodable reply: {}", err);
        MasterError::Corrupt
    }
}

// ============================================================================
// Master
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    /// Wait for a reply before an ACK extends it
    pub reply_timeout: Duration,
    /// Resends of a request that got no usable reply
    pub retries: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig { reply_timeout: Duration::from_secs(2), retries: 3 }
    }
}

/// A validated reply frame, trailer stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub data: Vec<u8>,
}

/// Outcome of a directory sync, by device file name
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub sent: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
    /// Local files whose names the device cannot hold
    pub skipped: Vec<String>,
}

pub struct Master {
    serial: Box<dyn SerialPort>,
    config: MasterConfig,
    cyclic: u8,
    lookahead: VecDeque<u8>,
}

impl Master {
    pub fn new(serial: Box<dyn SerialPort>, config: MasterConfig) -> Self {
        Master { serial, config, cyclic: 0, lookahead: VecDeque::new() }
    }

    /// Take over the Slave's retransmit memory for this session.
    ///
    /// Cyclic numbers restart at 0 with every `Master`, so the first
    /// requests of a session can carry the same key as the last request of
    /// an earlier one. A List is never replayed and replaces what the Slave
    /// remembers, after which no request of this session can be mistaken
    /// for a repeat of an older one.
    pub fn open_session(&mut self) -> Result<(), MasterError> {
        match self.list(0) {
            Ok(_) | Err(MasterError::Nak(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Round trip of a bare ACK.
    pub fn ping(&mut self, timeout_ms: u32) -> Result<Duration, MasterError> {
        let option = ack_option(timeout_ms);
        let started = Instant::now();
        self.exchange(Function::Ack, |cyclic| {
            Header::new(cyclic, Function::Ack, option).encode(Direction::Request).to_vec()
        })?;
        Ok(started.elapsed())
    }

    pub fn set_time(&mut self, time: &NaiveDateTime) -> Result<(), MasterError> {
        let stamp = Timestamp::from_datetime(time)
            .ok_or_else(|| MasterError::InvalidArgument(format!("{} cannot be sent to the device", time)))?;
        self.request(Request::SetTime, &stamp.to_bytes())?;
        Ok(())
    }

    pub fn format(&mut self) -> Result<FormatInfo, MasterError> {
        let frame = self.request(Request::Format, &[])?;
        Ok(FormatInfo::decode(&frame.data)?)
    }

    pub fn list(&mut self, options: u8) -> Result<Listing, MasterError> {
        let frame = self.request(Request::List, &[options])?;
        let listing = Listing::decode(&frame.data)?;
        Ok(listing)
    }

    pub fn remove(&mut self, name: &str) -> Result<SpaceInfo, MasterError> {
        let payload = counted_names(&[name])?;
        let frame = self.request(Request::Remove, &payload)?;
        Ok(SpaceInfo::decode(&frame.data)?)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<SpaceInfo, MasterError> {
        let payload = counted_names(&[from, to])?;
        let frame = self.request(Request::Rename, &payload)?;
        Ok(SpaceInfo::decode(&frame.data)?)
    }

    /// Store `contents` on the device as `name`, stamped with `modified`.
    pub fn send_file(&mut self, name: &str, contents: &[u8], modified: &NaiveDateTime) -> Result<SpaceInfo, MasterError> {
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(MasterError::InvalidArgument(format!("bad file name {:?}", name)));
        }
        let stamp = Timestamp::from_datetime(modified)
            .ok_or_else(|| MasterError::InvalidArgument(format!("{} cannot be sent to the device", modified)))?;

        let payload = file_payload(name, stamp, contents);
        let size = payload.len() + TRAILER_LEN;
        if size > MAX_SIZE as usize {
            return Err(MasterError::InvalidArgument(format!("{} is too large ({} bytes)", name, contents.len())));
        }
        let trailer = file_trailer(contents);

        debug!(name, len = contents.len(), "sending file");
        let frame = self.exchange(Function::Reply(Reply::Received), |cyclic| {
            let header = Header::new(cyclic, Function::Request(Request::File), size as u32);
            let mut frame = Vec::with_capacity(HEADER_LEN + size);
            frame.extend_from_slice(&header.encode(Direction::Request));
            frame.extend_from_slice(&payload);
            frame.extend_from_slice(&trailer);
            frame
        })?;
        Ok(SpaceInfo::decode(&frame.data)?)
    }

    /// Bring the device in line with `path`, a directory or a single file.
    ///
    /// Files whose size and checksum already match are left alone. With
    /// `clean`, device files with no local counterpart are removed. The
    /// opening List doubles as the session opener.
    pub fn sync(&mut self, path: &Path, clean: bool) -> Result<SyncReport, MasterError> {
        let listing = self.list(LIST_CHECKSUMS)?;
        let on_device: BTreeMap<&str, &ListEntry> =
            listing.entries.iter().map(|entry| (entry.name.as_str(), entry)).collect();
        let max_name = listing.header.max_name_length as usize;

        let mut report = SyncReport::default();
        let local = local_files(path)?;
        for (name, file) in &local {
            if name.len() > max_name {
                warn!(name = %name, max_name, "name too long for the device, skipping");
                report.skipped.push(name.clone());
                continue;
            }
            let contents = fs::read(file)?;
            let current = on_device.get(name.as_str()).is_some_and(|entry| {
                entry.size as usize == contents.len() && entry.checksum == Some(Adler32::checksum(&contents))
            });
            if current {
                debug!(name = %name, "unchanged");
                report.unchanged.push(name.clone());
                continue;
            }
            self.send_file(name, &contents, &modified_time(file)?)?;
            report.sent.push(name.clone());
        }

        if clean {
            for entry in &listing.entries {
                if local.iter().any(|(name, _)| *name == entry.name) {
                    continue;
                }
                match self.remove(&entry.name) {
                    Ok(_) => report.removed.push(entry.name.clone()),
                    // Already gone
                    Err(MasterError::Nak(NakCode::NotFound)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(report)
    }

    fn request(&mut self, request: Request, data: &[u8]) -> Result<Frame, MasterError> {
        self.exchange(Function::Reply(request.reply()), |cyclic| {
            encode_frame(Direction::Request, cyclic, Function::Request(request), data)
        })
    }

    /// Send a request and wait for its reply, resending with the same
    /// cyclic number when the reply is missing or damaged.
    fn exchange<F>(&mut self, expect: Function, build: F) -> Result<Frame, MasterError>
    where
        F: FnOnce(u8) -> Vec<u8>,
    {
        let cyclic = self.cyclic;
        let frame = build(cyclic);

        let mut attempt = 0;
        let result = loop {
            trace!(tx = %hex::encode(&frame));
            self.serial.write_all(&frame)?;
            match self.await_reply(cyclic, expect) {
                Err(MasterError::Timeout | MasterError::Corrupt) if attempt < self.config.retries => {
                    attempt += 1;
                    warn!(cyclic, attempt, "no usable reply, retrying");
                }
                other => break other,
            }
        };

        self.cyclic = (cyclic + 1) & CYCLIC_MAX;
        result
    }

    fn await_reply(&mut self, cyclic: u8, expect: Function) -> Result<Frame, MasterError> {
        let mut deadline = Instant::now() + self.config.reply_timeout;
        loop {
            let frame = self.read_frame(deadline)?;
            if frame.header.cyclic != cyclic {
                debug!(cyclic = frame.header.cyclic, "skipping stale reply");
                continue;
            }
            match frame.header.function {
                function if function == expect => return Ok(frame),
                Function::Ack => {
                    // Request accepted; the real reply may take this long
                    if let Some(ms) = ack_timeout(frame.header.size) {
                        debug!(timeout_ms = ms, "<- ACK");
                        deadline = Instant::now() + Duration::from_millis(ms as u64);
                    }
                }
                Function::Nak => {
                    return Err(match nak_code(frame.header.size) {
                        Some(code) => MasterError::Nak(code),
                        None => MasterError::UnexpectedReply(Function::Nak),
                    });
                }
                other => return Err(MasterError::UnexpectedReply(other)),
            }
        }
    }

    /// Read the next valid reply frame, skipping everything else.
    fn read_frame(&mut self, deadline: Instant) -> Result<Frame, MasterError> {
        loop {
            let Some(byte) = self.next_byte(deadline)? else {
                return Err(MasterError::Timeout);
            };
            if byte != STX {
                continue;
            }

            let mut header = [0u8; HEADER_LEN];
            header[0] = STX;
            for slot in header.iter_mut().skip(1) {
                *slot = self.next_byte(deadline)?.ok_or(MasterError::Timeout)?;
            }
            let Some(parsed) = parse_reply_header(&header) else {
                // Rescan from the byte after this sentinel
                for &b in header[1..].iter().rev() {
                    self.lookahead.push_front(b);
                }
                continue;
            };

            let len = parsed.data_len();
            if parsed.function.has_option() || parsed.size == 0 {
                return Ok(Frame { header: parsed, data: Vec::new() });
            }
            if (parsed.size as usize) < TRAILER_LEN {
                return Err(MasterError::Corrupt);
            }

            let mut body = vec![0u8; len + TRAILER_LEN];
            for slot in body.iter_mut() {
                *slot = self.next_byte(deadline)?.ok_or(MasterError::Timeout)?;
            }
            let trailer = u32::from_be_bytes([body[len], body[len + 1], body[len + 2], body[len + 3]]);
            body.truncate(len);
            if trailer != Adler32::checksum(&body) {
                debug!(cyclic = parsed.cyclic, "reply trailer mismatch");
                return Err(MasterError::Corrupt);
            }
            return Ok(Frame { header: parsed, data: body });
        }
    }

    fn next_byte(&mut self, deadline: Instant) -> Result<Option<u8>, MasterError> {
        if let Some(byte) = self.lookahead.pop_front() {
            return Ok(Some(byte));
        }
        let mut buf = [0u8; 64];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            match self.serial.read_timeout(&mut buf, wait) {
                Ok(0) => {}
                Ok(n) => {
                    self.lookahead.extend(&buf[1..n]);
                    return Ok(Some(buf[0]));
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_reply_header(bytes: &[u8; HEADER_LEN]) -> Option<Header> {
    let cyclic = Direction::Reply.decode_cyclic(bytes[1])?;
    let function = Function::from_code(bytes[2])?;
    if matches!(function, Function::Request(_)) {
        return None;
    }
    let checksum = Fletcher16::checksum(&bytes[..6]);
    if bytes[6] != (checksum >> 8) as u8 || bytes[7] != checksum as u8 {
        return None;
    }
    let size = (bytes[3] as u32) << 16 | (bytes[4] as u32) << 8 | bytes[5] as u32;
    Some(Header::new(cyclic, function, size))
}

/// Modification time of `path` as the device clock can record it.
///
/// Times before the device epoch, or that cannot be read, become the
/// current time.
pub fn modified_time(path: &Path) -> Result<NaiveDateTime, MasterError> {
    let modified = fs::metadata(path)?
        .modified()
        .ok()
        .map(|time| DateTime::<Utc>::from(time).naive_utc())
        .filter(|time| Timestamp::from_datetime(time).is_some());
    Ok(modified.unwrap_or_else(|| Utc::now().naive_utc()))
}

/// Regular files to sync from `path`, sorted by name.
fn local_files(path: &Path) -> Result<Vec<(String, PathBuf)>, MasterError> {
    if path.is_file() {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| MasterError::InvalidArgument(format!("no device name for {}", path.display())))?;
        return Ok(vec![(name.to_string(), path.to_path_buf())]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            debug!(path = %entry.path().display(), "not a regular file, skipping");
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => files.push((name, entry.path())),
            Err(name) => warn!(?name, "name is not UTF-8, skipping"),
        }
    }
    files.sort();
    Ok(files)
}

fn counted_names(names: &[&str]) -> Result<Vec<u8>, MasterError> {
    let mut payload = Vec::new();
    for name in names {
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(MasterError::InvalidArgument(format!("bad file name {:?}", name)));
        }
        payload.push(name.len() as u8);
        payload.extend_from_slice(name.as_bytes());
    }
    if payload.len() > SMALL_BUFFER_CAPACITY {
        return Err(MasterError::InvalidArgument("file names too long".to_string()));
    }
    Ok(payload)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use chrono::NaiveDate;
    use crate::clock::MockClock;
    use crate::engine::{Engine, EngineConfig};
    use crate::serial::{MockSerialPort, PipeSerialPort};
    use crate::storage::{MemStorage, Storage};

    fn config() -> MasterConfig {
        MasterConfig { reply_timeout: Duration::from_millis(20), retries: 1 }
    }

    fn script(bytes: &[u8]) -> Vec<Option<u8>> {
        bytes.iter().map(|&b| Some(b)).collect()
    }

    fn reply(cyclic: u8, reply: Reply, data: &[u8]) -> Vec<u8> {
        encode_frame(Direction::Reply, cyclic, Function::Reply(reply), data)
    }

    fn when() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap().and_hms_opt(10, 30, 0).unwrap()
    }

    #[test]
    fn test_set_time_skips_noise() {
        let request = encode_frame(Direction::Request, 0, Function::Request(Request::SetTime), &[15, 6, 5, 10, 30, 0]);
        let mut responses = b"debug: hello\n".to_vec();
        responses.push(STX);
        responses.extend(reply(0, Reply::TimeSet, &[]));

        let serial = MockSerialPort::new(script(&responses), request);
        let mut master = Master::new(Box::new(serial), config());
        master.set_time(&when()).expect("set time");
    }

    #[test]
    fn test_nak_becomes_error() {
        let request = encode_frame(Direction::Request, 0, Function::Request(Request::Remove), &[1, b'x']);
        let nak = Header::new(0, Function::Nak, nak_option(NakCode::NotFound)).encode(Direction::Reply);

        let serial = MockSerialPort::new(script(&nak), request);
        let mut master = Master::new(Box::new(serial), config());
        match master.remove("x") {
            Err(MasterError::Nak(NakCode::NotFound)) => {}
            other => panic!("expected NAK, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_then_reply() {
        let request = encode_frame(Direction::Request, 0, Function::Request(Request::Format), &[]);
        let mut responses = Header::new(0, Function::Ack, ack_option(30_000)).encode(Direction::Reply).to_vec();
        let info = FormatInfo { total_bytes: 4096, used_bytes: 0, max_name_length: 31 };
        responses.extend(reply(0, Reply::Formatted, &info.encode()));

        let serial = MockSerialPort::new(script(&responses), request);
        let mut master = Master::new(Box::new(serial), config());
        assert_eq!(master.format().expect("format"), info);
    }

    #[test]
    fn test_corrupt_reply_is_retried_with_same_cyclic() {
        let request = encode_frame(Direction::Request, 0, Function::Request(Request::Rename), &[1, b'a', 1, b'b']);
        let space = SpaceInfo { total_bytes: 100, free_bytes: 50 };
        let good = reply(0, Reply::Renamed, &space.encode());
        let mut bad = good.clone();
        bad[HEADER_LEN] ^= 0x01;
        let mut responses = bad;
        responses.extend_from_slice(&good);

        let mut expected = request.clone();
        expected.extend_from_slice(&request);
        let serial = MockSerialPort::new(script(&responses), expected);
        let mut master = Master::new(Box::new(serial), config());
        assert_eq!(master.rename("a", "b").expect("rename"), space);
    }

    #[test]
    fn test_stale_reply_skipped_and_cyclic_advances() {
        let first = Header::new(0, Function::Ack, ack_option(10)).encode(Direction::Request);
        let second = Header::new(1, Function::Ack, ack_option(10)).encode(Direction::Request);
        let mut responses = Header::new(0, Function::Ack, ack_option(10)).encode(Direction::Reply).to_vec();
        // A late duplicate of the first echo arrives before the second
        responses.extend_from_slice(&Header::new(0, Function::Ack, ack_option(10)).encode(Direction::Reply));
        responses.extend_from_slice(&Header::new(1, Function::Ack, ack_option(10)).encode(Direction::Reply));

        let mut expected = first.to_vec();
        expected.extend_from_slice(&second);
        let serial = MockSerialPort::new(script(&responses), expected);
        let mut master = Master::new(Box::new(serial), config());
        master.ping(10).expect("first ping");
        master.ping(10).expect("second ping");
    }

    #[test]
    fn test_silence_times_out() {
        let request = Header::new(0, Function::Ack, ack_option(10)).encode(Direction::Request);
        let mut expected = request.to_vec();
        expected.extend_from_slice(&request);
        let serial = MockSerialPort::new(vec![], expected);
        let mut master = Master::new(Box::new(serial), config());
        assert!(matches!(master.ping(10), Err(MasterError::Timeout)));
    }

    #[test]
    fn test_argument_checks() {
        let serial = MockSerialPort::new(vec![], vec![]);
        let mut master = Master::new(Box::new(serial), config());
        let long = "n".repeat(70);
        assert!(matches!(master.remove(&long), Err(MasterError::InvalidArgument(_))));
        assert!(matches!(master.send_file("", b"x", &when()), Err(MasterError::InvalidArgument(_))));
        let old = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert!(matches!(master.set_time(&old), Err(MasterError::InvalidArgument(_))));
    }

    /// Engine serving `storage` on a background thread, stopped on drop.
    struct Device {
        stop: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl Device {
        fn start(storage: &MemStorage, clock: &MockClock) -> (Device, PipeSerialPort) {
            let (master_end, device_end) = PipeSerialPort::pair();
            let mut engine = Engine::new(
                Box::new(device_end),
                Box::new(storage.clone()),
                Box::new(clock.clone()),
                EngineConfig { poll_timeout: Duration::from_millis(2), ..EngineConfig::default() },
            );
            let stop = Arc::new(AtomicBool::new(false));
            let thread = {
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        engine.poll().expect("engine poll");
                    }
                })
            };
            (Device { stop, thread: Some(thread) }, master_end)
        }
    }

    impl Drop for Device {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn session_config() -> MasterConfig {
        MasterConfig { reply_timeout: Duration::from_secs(2), retries: 0 }
    }

    #[test]
    fn test_open_session_lists_first() {
        let header = ListingHeader { total_bytes: 100, free_bytes: 100, max_name_length: 31, options: 0 };
        let mut expected = encode_frame(Direction::Request, 0, Function::Request(Request::List), &[0]);
        expected.extend(encode_frame(Direction::Request, 1, Function::Request(Request::Remove), &[1, b'x']));
        let mut responses = reply(0, Reply::Listing, &header.encode());
        responses.extend(reply(1, Reply::Removed, &SpaceInfo { total_bytes: 100, free_bytes: 100 }.encode()));

        let serial = MockSerialPort::new(script(&responses), expected);
        let mut master = Master::new(Box::new(serial), config());
        master.open_session().expect("open");
        master.remove("x").expect("remove");
    }

    #[test]
    fn test_open_session_accepts_refused_list() {
        let expected = encode_frame(Direction::Request, 0, Function::Request(Request::List), &[0]);
        let nak = Header::new(0, Function::Nak, nak_option(NakCode::FsError)).encode(Direction::Reply);

        let serial = MockSerialPort::new(script(&nak), expected);
        let mut master = Master::new(Box::new(serial), config());
        master.open_session().expect("open");
    }

    #[test]
    fn test_sessions_do_not_replay_each_other() {
        let storage = MemStorage::new(1000).with_file("x1", b"1").with_file("x2", b"2");
        let clock = MockClock::default();
        let (device, master_end) = Device::start(&storage, &clock);

        // Two sessions on one line, both starting from cyclic 0 with
        // requests of the same size
        let mut master = Master::new(Box::new(master_end), session_config());
        master.open_session().expect("first session");
        master.remove("x1").expect("remove x1");
        master.cyclic = 0;
        master.open_session().expect("second session");
        master.remove("x2").expect("remove x2");

        drop(device);
        assert!(storage.names().is_empty());
    }

    #[test]
    fn test_sync_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("a.txt"), b"fresh contents").expect("write");
        std::fs::write(dir.path().join("b.txt"), b"same").expect("write");
        std::fs::write(dir.path().join("this-name-is-far-too-long-for-the-device.txt"), b"x").expect("write");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");

        let storage = MemStorage::new(4096)
            .with_file("a.txt", b"stale")
            .with_file("b.txt", b"same")
            .with_file("c.txt", b"orphan");
        let clock = MockClock::default();
        let (device, master_end) = Device::start(&storage, &clock);
        let mut master = Master::new(Box::new(master_end), session_config());

        let report = master.sync(dir.path(), false).expect("sync");
        assert_eq!(report.sent, vec!["a.txt"]);
        assert_eq!(report.unchanged, vec!["b.txt"]);
        assert_eq!(report.skipped, vec!["this-name-is-far-too-long-for-the-device.txt"]);
        assert!(report.removed.is_empty());
        assert_eq!(storage.file("a.txt"), Some(b"fresh contents".to_vec()));
        assert!(storage.exists("c.txt"));

        let report = master.sync(dir.path(), true).expect("clean sync");
        assert!(report.sent.is_empty());
        assert_eq!(report.unchanged, vec!["a.txt", "b.txt"]);
        assert_eq!(report.removed, vec!["c.txt"]);

        drop(device);
        assert_eq!(storage.names(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_sync_single_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("boot.py");
        std::fs::write(&path, b"print(1)").expect("write");

        let storage = MemStorage::new(4096).with_file("main.py", b"keep");
        let clock = MockClock::default();
        let (device, master_end) = Device::start(&storage, &clock);
        let mut master = Master::new(Box::new(master_end), session_config());

        let report = master.sync(&path, false).expect("sync");
        assert_eq!(report.sent, vec!["boot.py"]);

        drop(device);
        assert_eq!(storage.names(), vec!["boot.py", "main.py"]);
        assert!(storage.state().files["boot.py"].timestamp.is_some());
    }

    #[test]
    fn test_modified_time_before_epoch_uses_now() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("old");
        std::fs::write(&path, b"x").expect("write");
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(946_684_800, 0)).expect("mtime");

        let stamp = modified_time(&path).expect("modified");
        assert!(Timestamp::from_datetime(&stamp).is_some());
        assert!(stamp.and_utc().timestamp() > 946_684_800);
    }

    #[test]
    fn test_end_to_end_session() {
        let storage = MemStorage::new(64 * 1024);
        let clock = MockClock::default();
        let (device, master_end) = Device::start(&storage, &clock);
        let mut master = Master::new(Box::new(master_end), session_config());

        master.ping(100).expect("ping");
        master.set_time(&when()).expect("set time");
        assert_eq!(clock.history(), vec![when()]);

        let contents: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        let space = master.send_file("www.bin", &contents, &when()).expect("send");
        assert_eq!(space.free_bytes, 64 * 1024 - 5000);
        assert_eq!(storage.file("www.bin"), Some(contents.clone()));

        let listing = master.list(LIST_OPTIONS_MASK).expect("list");
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "www.bin");
        assert_eq!(listing.entries[0].size, 5000);
        assert_eq!(listing.entries[0].checksum, Some(Adler32::checksum(&contents)));
        assert_eq!(listing.entries[0].timestamp, Timestamp::from_datetime(&when()));

        master.rename("www.bin", "site.bin").expect("rename");
        assert!(matches!(master.remove("www.bin"), Err(MasterError::Nak(NakCode::NotFound))));
        master.remove("site.bin").expect("remove");

        master.send_file("a", b"1", &when()).expect("send");
        let info = master.format().expect("format");
        assert_eq!(info.used_bytes, 0);
        drop(device);
        assert!(storage.names().is_empty());
    }
}
