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

//! Payload layouts, read through a bounds-checked cursor

use crate::protocol::{Timestamp, TIMESTAMP_LEN};

/// List option bit: include each file's timestamp
pub const LIST_DATES: u8 = 0x01;

/// List option bit: include each file's Adler-32
pub const LIST_CHECKSUMS: u8 = 0x02;

pub const LIST_OPTIONS_MASK: u8 = LIST_DATES | LIST_CHECKSUMS;

pub const LISTING_HEADER_LEN: usize = 10;

// ============================================================================
// Cursor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    /// A field runs past the end of the payload
    Truncated { wanted: usize, remaining: usize },
    /// Bytes left over after the last field
    Trailing(usize),
}

impl std::fmt::Display for CursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorError::Truncated { wanted, remaining } => {
                write!(f, "field of {} bytes with only {} remaining", wanted, remaining)
            }
            CursorError::Trailing(n) => write!(f, "{} unexpected trailing bytes", n),
        }
    }
}

impl std::error::Error for CursorError {}

/// Reads named fields off a payload, never past its declared end.
pub struct PayloadCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PayloadCursor { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CursorError> {
        if n > self.remaining() {
            return Err(CursorError::Truncated { wanted: n, remaining: self.remaining() });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CursorError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, CursorError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// A length byte followed by that many bytes.
    pub fn read_counted(&mut self) -> Result<&'a [u8], CursorError> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// Succeeds only if every byte has been consumed.
    pub fn finish(self) -> Result<(), CursorError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CursorError::Trailing(n)),
        }
    }
}

// ============================================================================
// Reply Payloads
// ============================================================================

/// Capacity and free space, carried by Removed, Renamed and Received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    pub total_bytes: u32,
    pub free_bytes: u32,
}

impl SpaceInfo {
    pub fn encode(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.total_bytes.to_be_bytes());
        bytes[4..].copy_from_slice(&self.free_bytes.to_be_bytes());
        bytes
    }

    pub fn decode(data: &[u8]) -> Result<Self, CursorError> {
        let mut cursor = PayloadCursor::new(data);
        let info = SpaceInfo {
            total_bytes: cursor.read_u32()?,
            free_bytes: cursor.read_u32()?,
        };
        cursor.finish()?;
        Ok(info)
    }
}

/// Carried by Formatted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub total_bytes: u32,
    pub used_bytes: u32,
    pub max_name_length: u8,
}

impl FormatInfo {
    pub fn encode(&self) -> [u8; 9] {
        let mut bytes = [0u8; 9];
        bytes[..4].copy_from_slice(&self.total_bytes.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.used_bytes.to_be_bytes());
        bytes[8] = self.max_name_length;
        bytes
    }

    pub fn decode(data: &[u8]) -> Result<Self, CursorError> {
        let mut cursor = PayloadCursor::new(data);
        let info = FormatInfo {
            total_bytes: cursor.read_u32()?,
            used_bytes: cursor.read_u32()?,
            max_name_length: cursor.read_u8()?,
        };
        cursor.finish()?;
        Ok(info)
    }
}

/// Global block at the start of a Listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingHeader {
    pub total_bytes: u32,
    pub free_bytes: u32,
    pub max_name_length: u8,
    pub options: u8,
}

impl ListingHeader {
    pub fn encode(&self) -> [u8; LISTING_HEADER_LEN] {
        let mut bytes = [0u8; LISTING_HEADER_LEN];
        bytes[..4].copy_from_slice(&self.total_bytes.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.free_bytes.to_be_bytes());
        bytes[8] = self.max_name_length;
        bytes[9] = self.options;
        bytes
    }

    /// Width of every entry that follows this header.
    pub fn entry_size(&self) -> usize {
        let mut size = self.max_name_length as usize + 4;
        if self.options & LIST_DATES != 0 {
            size += TIMESTAMP_LEN;
        }
        if self.options & LIST_CHECKSUMS != 0 {
            size += 4;
        }
        size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub size: u32,
    /// Present when dates were requested and the file has one
    pub timestamp: Option<Timestamp>,
    /// Present when checksums were requested; 0 on the wire means unreadable
    pub checksum: Option<u32>,
}

impl ListEntry {
    /// Append the fixed-width encoding to `out`. Names longer than the
    /// field are truncated.
    pub fn encode_into(&self, header: &ListingHeader, out: &mut Vec<u8>) {
        let width = header.max_name_length as usize;
        let name = self.name.as_bytes();
        let used = name.len().min(width);
        out.extend_from_slice(&name[..used]);
        out.resize(out.len() + width - used, 0);
        out.extend_from_slice(&self.size.to_be_bytes());
        if header.options & LIST_DATES != 0 {
            out.extend_from_slice(&self.timestamp.unwrap_or_default().to_bytes());
        }
        if header.options & LIST_CHECKSUMS != 0 {
            out.extend_from_slice(&self.checksum.unwrap_or(0).to_be_bytes());
        }
    }

    pub fn decode(cursor: &mut PayloadCursor<'_>, header: &ListingHeader) -> Result<Self, CursorError> {
        let raw = cursor.read_bytes(header.max_name_length as usize)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let name = String::from_utf8_lossy(&raw[..end]).into_owned();
        let size = cursor.read_u32()?;
        let timestamp = if header.options & LIST_DATES != 0 {
            let stamp = Timestamp::from_bytes(cursor.read_array()?);
            (stamp != Timestamp::default()).then_some(stamp)
        } else {
            None
        };
        let checksum = if header.options & LIST_CHECKSUMS != 0 {
            Some(cursor.read_u32()?)
        } else {
            None
        };
        Ok(ListEntry { name, size, timestamp, checksum })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub header: ListingHeader,
    pub entries: Vec<ListEntry>,
}

impl Listing {
    pub fn decode(data: &[u8]) -> Result<Self, CursorError> {
        let mut cursor = PayloadCursor::new(data);
        let header = ListingHeader {
            total_bytes: cursor.read_u32()?,
            free_bytes: cursor.read_u32()?,
            max_name_length: cursor.read_u8()?,
            options: cursor.read_u8()?,
        };
        let mut entries = Vec::new();
        while cursor.remaining() > 0 {
            entries.push(ListEntry::decode(&mut cursor, &header)?);
        }
        Ok(Listing { header, entries })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_rejects_reads_past_end() {
        let mut cursor = PayloadCursor::new(&[3, b'a', b'b']);
        assert_eq!(
            cursor.read_counted(),
            Err(CursorError::Truncated { wanted: 3, remaining: 2 })
        );
    }

    #[test]
    fn test_cursor_counted_fields() {
        let data = [1, b'a', 2, b'b', b'c'];
        let mut cursor = PayloadCursor::new(&data);
        assert_eq!(cursor.read_counted().unwrap(), b"a");
        assert_eq!(cursor.read_counted().unwrap(), b"bc");
        assert!(cursor.finish().is_ok());
    }

    #[test]
    fn test_cursor_finish_reports_leftovers() {
        let mut cursor = PayloadCursor::new(&[1, 2, 3]);
        cursor.read_u8().unwrap();
        assert_eq!(cursor.finish(), Err(CursorError::Trailing(2)));
    }

    #[test]
    fn test_space_info_layout() {
        let info = SpaceInfo { total_bytes: 0x0102_0304, free_bytes: 0x0A0B_0C0D };
        assert_eq!(info.encode(), [1, 2, 3, 4, 0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(SpaceInfo::decode(&info.encode()), Ok(info));
        assert!(SpaceInfo::decode(&[0; 7]).is_err());
    }

    #[test]
    fn test_list_entry_fixed_width() {
        let header = ListingHeader { total_bytes: 0, free_bytes: 0, max_name_length: 8, options: LIST_DATES | LIST_CHECKSUMS };
        let entry = ListEntry {
            name: "a.txt".to_string(),
            size: 5,
            timestamp: Some(Timestamp::from_bytes([15, 6, 5, 10, 30, 0])),
            checksum: Some(0x1234_5678),
        };
        let mut out = Vec::new();
        entry.encode_into(&header, &mut out);
        assert_eq!(out.len(), header.entry_size());
        assert_eq!(&out[..8], b"a.txt\0\0\0");
        assert_eq!(&out[8..12], &[0, 0, 0, 5]);
        assert_eq!(&out[12..18], &[15, 6, 5, 10, 30, 0]);
        assert_eq!(&out[18..], &[0x12, 0x34, 0x56, 0x78]);

        let mut cursor = PayloadCursor::new(&out);
        assert_eq!(ListEntry::decode(&mut cursor, &header), Ok(entry));
    }

    #[test]
    fn test_listing_without_options() {
        let header = ListingHeader { total_bytes: 100, free_bytes: 60, max_name_length: 4, options: 0 };
        let mut data = header.encode().to_vec();
        for (name, size) in [("ab", 10u32), ("cdef", 30)] {
            ListEntry { name: name.to_string(), size, timestamp: None, checksum: None }
                .encode_into(&header, &mut data);
        }
        assert_eq!(data.len(), LISTING_HEADER_LEN + 2 * header.entry_size());

        let listing = Listing::decode(&data).expect("decode");
        assert_eq!(listing.header, header);
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[1].name, "cdef");
        assert_eq!(listing.entries[1].size, 30);
        assert_eq!(listing.entries[0].checksum, None);
    }
}
