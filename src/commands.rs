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

//! Handlers for the requests whose payload fits the small-message buffer
//!
//! Every handler answers with exactly one reply or NAK. Only transport
//! failures are returned as errors.

use std::io::{self, Read};
use tracing::{debug, info, warn};
use crate::checksum::Adler32;
use crate::clock::Clock;
use crate::message::*;
use crate::protocol::*;
use crate::response::Responder;
use crate::storage::{validate_name, FsInfo, Storage, TEMP_NAME};

/// Reply timeout announced before formatting
pub const FORMAT_ACK_MS: u32 = 30_000;

/// Reply timeout announced before a listing, per file
pub const LIST_ACK_MS: u32 = 1_000;

pub fn set_time(responder: &mut Responder<'_>, clock: &mut dyn Clock, payload: &[u8]) -> io::Result<()> {
    let stamp = PayloadCursor::new(payload)
        .read_array::<TIMESTAMP_LEN>()
        .ok()
        .map(Timestamp::from_bytes);

    match stamp.and_then(Timestamp::to_datetime) {
        Some(time) => {
            let previous = clock.now();
            clock.set_time(time);
            info!(%time, %previous, "clock set");
            responder.reply(Reply::TimeSet, &[])
        }
        None => {
            debug!(payload = %hex::encode(payload), "invalid timestamp");
            responder.nak(NakCode::Format)
        }
    }
}

pub fn format(responder: &mut Responder<'_>, storage: &mut dyn Storage) -> io::Result<()> {
    if let Err(e) = storage.begin() {
        warn!("storage unavailable: {}", e);
        return responder.nak(NakCode::FsError);
    }
    responder.ack(FORMAT_ACK_MS)?;

    let result = storage.format().and_then(|_| storage.info());
    match result {
        Ok(fs) => {
            info!(total = fs.total_bytes, page_size = fs.page_size, max_open_files = fs.max_open_files, "storage formatted");
            let reply = FormatInfo {
                total_bytes: fs.total_bytes,
                used_bytes: fs.used_bytes,
                max_name_length: fs.max_name_length,
            };
            responder.reply(Reply::Formatted, &reply.encode())
        }
        Err(e) => {
            warn!("format failed: {}", e);
            responder.nak(NakCode::FsError)
        }
    }
}

pub fn list(responder: &mut Responder<'_>, storage: &mut dyn Storage, payload: &[u8]) -> io::Result<()> {
    let requested = payload.first().copied().unwrap_or(0);

    if let Err(e) = storage.begin() {
        warn!("storage unavailable: {}", e);
        return responder.nak(NakCode::FsError);
    }
    responder.ack(LIST_ACK_MS)?;

    let (fs, names) = match storage.info().and_then(|fs| Ok((fs, storage.list()?))) {
        Ok(found) => found,
        Err(e) => {
            warn!("listing failed: {}", e);
            return responder.nak(NakCode::FsError);
        }
    };
    let files: Vec<_> = names.into_iter().filter(|entry| entry.name != TEMP_NAME).collect();

    let header = ListingHeader {
        total_bytes: fs.total_bytes,
        free_bytes: fs.free_bytes(),
        max_name_length: fs.max_name_length,
        options: requested & LIST_OPTIONS_MASK,
    };
    let data_len = header.entry_size()
        .checked_mul(files.len())
        .and_then(|n| n.checked_add(LISTING_HEADER_LEN))
        .filter(|&n| n + TRAILER_LEN <= MAX_SIZE as usize);
    let Some(data_len) = data_len else {
        warn!(files = files.len(), "listing does not fit one reply");
        return responder.nak(NakCode::BadSize);
    };

    debug!(files = files.len(), options = header.options, "sending listing");
    responder.begin_stream(Reply::Listing, data_len)?;
    responder.stream(&header.encode())?;

    let mut encoded = Vec::with_capacity(header.entry_size());
    for file in files {
        let timestamp = if header.options & LIST_DATES != 0 {
            storage.timestamp(&file.name).and_then(|time| Timestamp::from_datetime(&time))
        } else {
            None
        };
        let checksum = if header.options & LIST_CHECKSUMS != 0 {
            Some(file_checksum(storage, &file.name, &fs).unwrap_or(0))
        } else {
            None
        };
        let entry = ListEntry { name: file.name, size: file.size, timestamp, checksum };

        encoded.clear();
        entry.encode_into(&header, &mut encoded);
        responder.stream(&encoded)?;
    }
    responder.end_stream()
}

pub fn remove(responder: &mut Responder<'_>, storage: &mut dyn Storage, payload: &[u8]) -> io::Result<()> {
    let mut cursor = PayloadCursor::new(payload);
    let raw = match cursor.read_counted().and_then(|name| cursor.finish().map(|_| name)) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("malformed remove: {}", e);
            return responder.nak(NakCode::Format);
        }
    };

    let fs = match storage.begin().and_then(|_| storage.info()) {
        Ok(fs) => fs,
        Err(e) => {
            warn!("storage unavailable: {}", e);
            return responder.nak(NakCode::FsError);
        }
    };
    let name = match validate_name(raw, fs.max_name_length) {
        Ok(name) => name,
        Err(code) => return responder.nak(code),
    };

    if !storage.exists(name) {
        debug!(name, "remove: no such file");
        return responder.nak(NakCode::NotFound);
    }
    if let Err(e) = storage.remove(name) {
        warn!(name, "remove failed: {}", e);
        return responder.nak(NakCode::FsError);
    }
    info!(name, "removed");
    reply_space(responder, storage, Reply::Removed)
}

pub fn rename(responder: &mut Responder<'_>, storage: &mut dyn Storage, payload: &[u8]) -> io::Result<()> {
    let mut cursor = PayloadCursor::new(payload);
    let names = cursor.read_counted()
        .and_then(|from| Ok((from, cursor.read_counted()?)))
        .and_then(|names| cursor.finish().map(|_| names));
    let (raw_from, raw_to) = match names {
        Ok(names) => names,
        Err(e) => {
            debug!("malformed rename: {}", e);
            return responder.nak(NakCode::Format);
        }
    };

    let fs = match storage.begin().and_then(|_| storage.info()) {
        Ok(fs) => fs,
        Err(e) => {
            warn!("storage unavailable: {}", e);
            return responder.nak(NakCode::FsError);
        }
    };
    let (from, to) = match (validate_name(raw_from, fs.max_name_length), validate_name(raw_to, fs.max_name_length)) {
        (Ok(from), Ok(to)) => (from, to),
        (Err(code), _) | (_, Err(code)) => return responder.nak(code),
    };

    if !storage.exists(from) {
        debug!(from, "rename: no such file");
        return responder.nak(NakCode::NotFound);
    }
    if storage.exists(to) {
        debug!(to, "rename: destination exists");
        return responder.nak(NakCode::Exists);
    }
    if let Err(e) = storage.rename(from, to) {
        warn!(from, to, "rename failed: {}", e);
        return responder.nak(NakCode::FsError);
    }
    info!(from, to, "renamed");
    reply_space(responder, storage, Reply::Renamed)
}

/// Reply with the store's total and free space.
pub fn reply_space(responder: &mut Responder<'_>, storage: &dyn Storage, reply: Reply) -> io::Result<()> {
    match storage.info() {
        Ok(fs) => {
            let space = SpaceInfo { total_bytes: fs.total_bytes, free_bytes: fs.free_bytes() };
            responder.reply(reply, &space.encode())
        }
        Err(e) => {
            warn!("storage info failed: {}", e);
            responder.nak(NakCode::FsError)
        }
    }
}

/// Adler-32 of a stored file, read a page at a time.
fn file_checksum(storage: &dyn Storage, name: &str, fs: &FsInfo) -> Option<u32> {
    let mut file = match storage.open(name) {
        Ok(file) => file,
        Err(e) => {
            warn!(name, "cannot read for checksum: {}", e);
            return None;
        }
    };
    let mut page = vec![0u8; fs.page_size.max(1)];
    let mut sum = Adler32::new();
    loop {
        match file.read(&mut page) {
            Ok(0) => return Some(sum.value()),
            Ok(n) => sum.update_slice(&page[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(name, "read failed during checksum: {}", e);
                return None;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
