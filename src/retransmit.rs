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

//! Single-slot memory of the last request, used to spot retransmissions

use std::time::{Duration, Instant};
use crate::protocol::{Header, Request};

/// What identifies a request on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestKey {
    pub cyclic: u8,
    pub request: Request,
    pub size: u32,
}

impl RequestKey {
    pub fn new(header: &Header, request: Request) -> Self {
        RequestKey { cyclic: header.cyclic, request, size: header.size }
    }
}

#[derive(Debug)]
struct Completed {
    key: RequestKey,
    reply: Vec<u8>,
    at: Instant,
}

#[derive(Debug)]
pub struct RetransmitTracker {
    last: Option<Completed>,
    /// How long a Master may keep resending one request
    window: Duration,
}

impl RetransmitTracker {
    pub fn new(window: Duration) -> Self {
        RetransmitTracker { last: None, window }
    }

    /// Cached reply if `key` repeats the previous request.
    ///
    /// Requests that are safe to run again never match, so they are
    /// executed afresh. A request arriving after the window has passed is
    /// a new one even when its key matches.
    pub fn replay_for(&self, key: &RequestKey) -> Option<&[u8]> {
        if key.request.is_idempotent() {
            return None;
        }
        match &self.last {
            Some(last) if last.key == *key && last.at.elapsed() < self.window => Some(&last.reply),
            _ => None,
        }
    }

    /// Remember a request that was validated and acted upon.
    pub fn complete(&mut self, key: RequestKey, reply: Vec<u8>) {
        self.last = Some(Completed { key, reply, at: Instant::now() });
    }
}
