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

//! Streaming checksums: Fletcher-16 guards headers, Adler-32 guards payloads.

const MOD_ADLER: u32 = 65521;

/// Fletcher-16 with two wrapping 8-bit sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fletcher16 {
    sum1: u8,
    sum2: u8,
}

impl Fletcher16 {
    pub fn new() -> Self {
        Fletcher16::default()
    }

    pub fn update(&mut self, byte: u8) {
        self.sum1 = self.sum1.wrapping_add(byte);
        self.sum2 = self.sum2.wrapping_add(self.sum1);
    }

    pub fn update_slice(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.update(byte);
        }
    }

    pub fn value(&self) -> u16 {
        ((self.sum2 as u16) << 8) | self.sum1 as u16
    }

    pub fn checksum(bytes: &[u8]) -> u16 {
        let mut sum = Fletcher16::new();
        sum.update_slice(bytes);
        sum.value()
    }
}

/// Adler-32, zlib compatible (seeded with a = 1, b = 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adler32 {
    a: u32,
    b: u32,
}

impl Default for Adler32 {
    fn default() -> Self {
        Adler32 { a: 1, b: 0 }
    }
}

impl Adler32 {
    pub fn new() -> Self {
        Adler32::default()
    }

    pub fn update(&mut self, byte: u8) {
        self.a = (self.a + byte as u32) % MOD_ADLER;
        self.b = (self.b + self.a) % MOD_ADLER;
    }

    pub fn update_slice(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.update(byte);
        }
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }

    pub fn checksum(bytes: &[u8]) -> u32 {
        let mut sum = Adler32::new();
        sum.update_slice(bytes);
        sum.value()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32_known_vectors() {
        assert_eq!(Adler32::checksum(b""), 0x0000_0001);
        assert_eq!(Adler32::checksum(b"a"), 0x0062_0062);
        assert_eq!(Adler32::checksum(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn test_adler32_modulus_wraps() {
        // Enough 0xFF bytes to push both sums past 65521
        let data = vec![0xFFu8; 5552 * 2];
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in &data {
            a = (a + byte as u64) % 65521;
            b = (b + a) % 65521;
        }
        assert_eq!(Adler32::checksum(&data), ((b << 16) | a) as u32);
    }

    #[test]
    fn test_adler32_incremental_matches_oneshot() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut sum = Adler32::new();
        for chunk in data.chunks(37) {
            sum.update_slice(chunk);
        }
        assert_eq!(sum.value(), Adler32::checksum(&data));
    }

    #[test]
    fn test_fletcher16_sums() {
        assert_eq!(Fletcher16::checksum(&[]), 0x0000);
        assert_eq!(Fletcher16::checksum(&[0x02]), 0x0202);
        assert_eq!(Fletcher16::checksum(&[0x01, 0x02]), 0x0403);
        // both sums wrap at 256
        assert_eq!(Fletcher16::checksum(&[0xFF, 0x02]), 0x0001);
    }

    #[test]
    fn test_fletcher16_detects_transposition() {
        let a = Fletcher16::checksum(&[0x02, 0x20, 0x61, 0x00, 0x00, 0x05]);
        let b = Fletcher16::checksum(&[0x02, 0x20, 0x61, 0x00, 0x05, 0x00]);
        assert_ne!(a, b);
    }
}
