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

//! Flat file storage the Slave synchronizes into

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use chrono::{DateTime, NaiveDateTime, Utc};
use filetime::FileTime;
use crate::protocol::NakCode;

/// Reserved name incoming files are staged under until verified
pub const TEMP_NAME: &str = ".~incoming";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub total_bytes: u32,
    pub used_bytes: u32,
    /// Natural write unit; incoming files are written in chunks of this size
    pub page_size: usize,
    pub max_open_files: u8,
    pub max_name_length: u8,
}

impl FsInfo {
    pub fn free_bytes(&self) -> u32 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u32,
}

// ============================================================================
// Storage Trait
// ============================================================================

/// Flat (no subdirectories) file store
pub trait Storage: Send {
    /// Mount or otherwise ready the store. Called before every operation.
    fn begin(&mut self) -> std::io::Result<()>;

    fn info(&self) -> std::io::Result<FsInfo>;

    fn list(&self) -> std::io::Result<Vec<DirEntry>>;

    fn exists(&self, name: &str) -> bool;

    /// Create or truncate `name` for writing.
    fn create(&mut self, name: &str) -> std::io::Result<Box<dyn Write + Send>>;

    fn open(&self, name: &str) -> std::io::Result<Box<dyn Read + Send>>;

    fn remove(&mut self, name: &str) -> std::io::Result<()>;

    fn rename(&mut self, from: &str, to: &str) -> std::io::Result<()>;

    /// Erase every file.
    fn format(&mut self) -> std::io::Result<()>;

    fn timestamp(&self, name: &str) -> Option<NaiveDateTime>;

    fn set_timestamp(&mut self, name: &str, time: NaiveDateTime) -> std::io::Result<()>;
}

/// Check a name received from the wire and borrow it as text.
pub fn validate_name(raw: &[u8], max_name_length: u8) -> Result<&str, NakCode> {
    if raw.is_empty() || raw.len() > max_name_length as usize {
        return Err(NakCode::BadName);
    }
    let name = std::str::from_utf8(raw).map_err(|_| NakCode::BadName)?;
    if name == "." || name == ".." || name == TEMP_NAME {
        return Err(NakCode::BadName);
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(NakCode::BadName);
    }
    Ok(name)
}

// ============================================================================
// Directory-backed Storage
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct DirConfig {
    pub capacity: u32,
    pub page_size: usize,
    pub max_open_files: u8,
    pub max_name_length: u8,
}

impl Default for DirConfig {
    fn default() -> Self {
        DirConfig {
            capacity: 1024 * 1024,
            page_size: 256,
            max_open_files: 5,
            max_name_length: 31,
        }
    }
}

/// Emulates a flash file system inside one host directory
pub struct DirStorage {
    root: PathBuf,
    config: DirConfig,
}

impl DirStorage {
    pub fn new(root: PathBuf, config: DirConfig) -> Self {
        DirStorage { root, config }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn used_bytes(&self) -> std::io::Result<u64> {
        let mut used = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                used += metadata.len();
            }
        }
        Ok(used)
    }
}

/// File handle that refuses to grow the store past its capacity
struct CappedFile {
    file: File,
    budget: u64,
}

impl Write for CappedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let allowed = buf.len().min(self.budget as usize);
        if allowed == 0 {
            return Ok(0);
        }
        let written = self.file.write(&buf[..allowed])?;
        self.budget -= written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Storage for DirStorage {
    fn begin(&mut self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    fn info(&self) -> std::io::Result<FsInfo> {
        let used = self.used_bytes()?;
        Ok(FsInfo {
            total_bytes: self.config.capacity,
            used_bytes: used.min(u32::MAX as u64) as u32,
            page_size: self.config.page_size,
            max_open_files: self.config.max_open_files,
            max_name_length: self.config.max_name_length,
        })
    }

    fn list(&self) -> std::io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            // Host files the device could never have created are not listed
            let Ok(name) = entry.file_name().into_string() else { continue };
            if name != TEMP_NAME && validate_name(name.as_bytes(), self.config.max_name_length).is_err() {
                continue;
            }
            entries.push(DirEntry {
                name,
                size: metadata.len().min(u32::MAX as u64) as u32,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    fn create(&mut self, name: &str) -> std::io::Result<Box<dyn Write + Send>> {
        let path = self.path(name);
        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let used = self.used_bytes()?.saturating_sub(existing);
        let file = File::create(&path)?;
        Ok(Box::new(CappedFile {
            file,
            budget: (self.config.capacity as u64).saturating_sub(used),
        }))
    }

    fn open(&self, name: &str) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.path(name))?))
    }

    fn remove(&mut self, name: &str) -> std::io::Result<()> {
        fs::remove_file(self.path(name))
    }

    fn rename(&mut self, from: &str, to: &str) -> std::io::Result<()> {
        fs::rename(self.path(from), self.path(to))
    }

    fn format(&mut self) -> std::io::Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.metadata()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn timestamp(&self, name: &str) -> Option<NaiveDateTime> {
        let modified = fs::metadata(self.path(name)).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified).naive_utc())
    }

    fn set_timestamp(&mut self, name: &str, time: NaiveDateTime) -> std::io::Result<()> {
        let mtime = FileTime::from_unix_time(time.and_utc().timestamp(), 0);
        filetime::set_file_mtime(self.path(name), mtime)
    }
}

// ============================================================================
// In-memory Storage for Testing
// ============================================================================

#[cfg(test)]
pub use mem::{MemFile, MemStorage};


// ============================================================================
// Tests
// ============================================================================
