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

use chrono::{NaiveDateTime, TimeDelta, Utc};

/// Device real-time clock
pub trait Clock: Send {
    fn set_time(&mut self, time: NaiveDateTime);

    fn now(&self) -> NaiveDateTime;
}

/// Device clock kept as an offset from the host's clock, so setting it
/// needs no privileges.
#[derive(Debug, Default)]
pub struct OffsetClock {
    offset: TimeDelta,
}

impl OffsetClock {
    pub fn new() -> Self {
        OffsetClock::default()
    }
}

impl Clock for OffsetClock {
    fn set_time(&mut self, time: NaiveDateTime) {
        self.offset = time - Utc::now().naive_utc();
    }

    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc() + self.offset
    }
}

// ============================================================================
// Mock Clock for Testing
// ============================================================================

#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    set: std::sync::Arc<std::sync::Mutex<Vec<NaiveDateTime>>>,
}

#[cfg(test)]
impl MockClock {
    /// Every time the clock was set, oldest first.
    pub fn history(&self) -> Vec<NaiveDateTime> {
        self.set.lock().expect("clock lock").clone()
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn set_time(&mut self, time: NaiveDateTime) {
        self.set.lock().expect("clock lock").push(time);
    }

    fn now(&self) -> NaiveDateTime {
        self.history().last().copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_offset_clock_tracks_set_time() {
        let mut clock = OffsetClock::new();
        let target = NaiveDate::from_ymd_opt(2030, 1, 2).unwrap().and_hms_opt(3, 4, 5).unwrap();
        clock.set_time(target);
        let drift = clock.now() - target;
        assert!(drift >= TimeDelta::zero() && drift < TimeDelta::seconds(5), "drift {:?}", drift);
    }
}
