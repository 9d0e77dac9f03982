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

// Flash file synchronization over a shared serial line
mod checksum;
mod clock;
mod commands;
mod engine;
mod master;
mod message;
mod protocol;
mod receiver;
mod recognizer;
mod response;
mod retransmit;
mod serial;
mod storage;

use clap::{Parser, Subcommand};
use chrono::Utc;
use serialport::{DataBits, Parity, StopBits};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use clock::OffsetClock;
use engine::{Engine, EngineConfig, EngineError};
use master::{modified_time, Master, MasterConfig, MasterError};
use message::{LIST_CHECKSUMS, LIST_DATES};
use serial::RealSerialPort;
use storage::{DirConfig, DirStorage};

#[derive(Parser)]
#[command(name = "flashsync")]
#[command(about = "Synchronize files into a device's flash file system over a shared serial line", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Act as the device, keeping its files in a directory
    Serve {
        /// Directory holding the device's files
        #[arg(short, long)]
        root: PathBuf,

        /// Capacity of the emulated flash in bytes
        #[arg(long, default_value = "1048576", value_name = "BYTES")]
        capacity: u32,

        /// Flash page size in bytes
        #[arg(long, default_value = "256", value_name = "BYTES")]
        page_size: usize,

        /// Longest file name the device accepts
        #[arg(long, default_value = "31", value_name = "LEN")]
        max_name: u8,
    },
    /// Check the device answers
    Ping {
        /// Timeout to announce, in milliseconds
        #[arg(short, long, default_value = "1000", value_name = "MS")]
        timeout: u32,

        /// Number of pings to send
        #[arg(short, long, default_value = "1")]
        count: u32,
    },
    /// Set the device clock to the current UTC time
    Time,
    /// Erase every file on the device
    Format,
    /// List the files on the device
    List {
        /// Include modification times
        #[arg(long)]
        dates: bool,

        /// Include content checksums
        #[arg(long)]
        checksums: bool,
    },
    /// Remove a file from the device
    Rm {
        name: String,
    },
    /// Rename a file on the device
    Mv {
        from: String,
        to: String,
    },
    /// Copy a file to the device
    Send {
        /// File to send
        file: PathBuf,

        /// Name on the device (defaults to the file's name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Bring the device in line with a directory or file
    Sync {
        /// Directory or file to sync
        path: PathBuf,

        /// Remove device files that are not in PATH
        #[arg(short, long)]
        clean: bool,

        /// Format the device before syncing
        #[arg(short, long)]
        format: bool,

        /// Keep syncing, waiting this long between passes
        #[arg(short, long, value_name = "SECS")]
        watch: Option<u64>,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(if cli.debug { "debug" } else { "info" }))
        .with_writer(std::io::stderr)
        .init();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(port = %cli.port, baud = cli.baud, ?data_bits, ?parity, ?stop_bits, "opening serial port");

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Serve { root, capacity, page_size, max_name } => {
            let config = DirConfig { capacity, page_size, max_name_length: max_name, ..DirConfig::default() };
            if let Err(e) = serve(serial_port, root, config) {
                eprintln!("Serve failed: {}", e);
                std::process::exit(1);
            }
        }
        command => {
            let mut master = Master::new(Box::new(serial_port), MasterConfig::default());
            if let Err(e) = run_command(&mut master, command) {
                eprintln!("Command failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn serve(serial_port: RealSerialPort, root: PathBuf, config: DirConfig) -> Result<(), EngineError> {
    if !root.is_dir() {
        return Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Storage directory not found: {}", root.display()),
        )));
    }

    tracing::info!(root = %root.display(), capacity = config.capacity, "serving");
    let mut engine = Engine::new(
        Box::new(serial_port),
        Box::new(DirStorage::new(root, config)),
        Box::new(OffsetClock::new()),
        EngineConfig::default(),
    );

    // Everything that is not protocol traffic goes to stdout
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut active = false;
    loop {
        let status = engine.poll()?;
        if engine.protocol_active(true) != active {
            active = !active;
            tracing::debug!(?status, active, "protocol activity changed");
        }
        let mut wrote = false;
        while let Some(byte) = engine.take_data() {
            out.write_all(&[byte])?;
            wrote = true;
        }
        if wrote {
            out.flush()?;
        }
    }
}

fn run_command(master: &mut Master, command: Commands) -> Result<(), MasterError> {
    match command {
        Commands::Serve { .. } => Ok(()),
        Commands::Ping { timeout, count } => {
            let mut answered = 0;
            for _ in 0..count {
                match master.ping(timeout) {
                    Ok(elapsed) => {
                        answered += 1;
                        println!("Device answered in {} ms", elapsed.as_millis());
                    }
                    Err(MasterError::Timeout) => println!("No reply"),
                    Err(e) => return Err(e),
                }
            }
            println!("{} pings, {} replies", count, answered);
            if answered == 0 {
                return Err(MasterError::Timeout);
            }
            Ok(())
        }
        Commands::Time => {
            master.open_session()?;
            let now = Utc::now().naive_utc();
            master.set_time(&now)?;
            println!("Device clock set to {}", now.format("%Y-%m-%d %H:%M:%S"));
            Ok(())
        }
        Commands::Format => {
            master.open_session()?;
            let info = master.format()?;
            println!("Formatted: {} of {} bytes used", info.used_bytes, info.total_bytes);
            Ok(())
        }
        Commands::List { dates, checksums } => {
            let mut options = 0;
            if dates {
                options |= LIST_DATES;
            }
            if checksums {
                options |= LIST_CHECKSUMS;
            }
            let listing = master.list(options)?;
            for entry in &listing.entries {
                let mut line = format!("{:<width$} {:>10}", entry.name, entry.size, width = listing.header.max_name_length as usize);
                if listing.header.options & LIST_DATES != 0 {
                    match entry.timestamp.and_then(|stamp| stamp.to_datetime()) {
                        Some(time) => line.push_str(&format!("  {}", time.format("%Y-%m-%d %H:%M:%S"))),
                        None => line.push_str(&format!("  {:<19}", "-")),
                    }
                }
                if let Some(checksum) = entry.checksum {
                    line.push_str(&format!("  {:08x}", checksum));
                }
                println!("{}", line);
            }
            println!(
                "{} files, {} of {} bytes free",
                listing.entries.len(), listing.header.free_bytes, listing.header.total_bytes
            );
            Ok(())
        }
        Commands::Rm { name } => {
            master.open_session()?;
            let space = master.remove(&name)?;
            println!("Removed {} ({} of {} bytes free)", name, space.free_bytes, space.total_bytes);
            Ok(())
        }
        Commands::Mv { from, to } => {
            master.open_session()?;
            master.rename(&from, &to)?;
            println!("Renamed {} to {}", from, to);
            Ok(())
        }
        Commands::Send { file, name } => {
            let name = match name.or_else(|| file.file_name().and_then(|n| n.to_str()).map(str::to_string)) {
                Some(name) => name,
                None => {
                    return Err(MasterError::InvalidArgument(format!("no device name for {}", file.display())));
                }
            };
            let contents = std::fs::read(&file)?;
            let modified = modified_time(&file)?;
            master.open_session()?;
            let space = master.send_file(&name, &contents, &modified)?;
            println!("Sent {} ({} bytes, {} of {} bytes free)", name, contents.len(), space.free_bytes, space.total_bytes);
            Ok(())
        }
        Commands::Sync { path, clean, format, watch } => {
            if format {
                master.open_session()?;
                let info = master.format()?;
                println!("Formatted: {} bytes", info.total_bytes);
            }
            loop {
                let report = master.sync(&path, clean)?;
                for name in &report.sent {
                    println!("Sent {}", name);
                }
                for name in &report.removed {
                    println!("Removed {}", name);
                }
                for name in &report.skipped {
                    println!("Skipped {} (name too long)", name);
                }
                println!(
                    "{} sent, {} unchanged, {} removed, {} skipped",
                    report.sent.len(), report.unchanged.len(), report.removed.len(), report.skipped.len()
                );
                match watch {
                    Some(secs) => std::thread::sleep(std::time::Duration::from_secs(secs)),
                    None => return Ok(()),
                }
            }
        }
    }
}
