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

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;
#[cfg(test)]
use std::time::Instant;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum BusError {
    #[error("can't open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can't {what}: {source}")]
    Configure {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("invalid {what} '{value}', expected {expected}")]
    InvalidSetting {
        what: &'static str,
        value: String,
        expected: &'static str,
    },
}

// ============================================================================
// DuplexChannel Trait
// ============================================================================

/// Blocking byte channel to the peripheral, already configured by the caller
pub trait DuplexChannel {
    /// Issue one write and report how many bytes went out
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    fn read_byte(&mut self) -> std::io::Result<u8>;
}

// ============================================================================
// Linux spidev Implementation
// ============================================================================

/// Bus parameters for a spidev character device
#[derive(Debug, Clone)]
pub struct SpiSettings {
    pub device: PathBuf,
    pub mode: u32,
    pub bits_per_word: u8,
    pub speed_hz: u32,
}

impl Default for SpiSettings {
    fn default() -> Self {
        SpiSettings {
            device: PathBuf::from("/dev/spidev1.0"),
            mode: 0,
            bits_per_word: 8,
            speed_hz: 15_000_000,
        }
    }
}

// _IOC layout: dir | size | type:8 | nr:8. Generic targets use a 2-bit dir
// at bit 30 with 14 size bits; mips, powerpc and sparc use a 3-bit dir at
// bit 29 with 13 size bits and different read/write flags.
#[cfg(not(any(
    target_arch = "mips",
    target_arch = "mips32r6",
    target_arch = "mips64",
    target_arch = "mips64r6",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc",
    target_arch = "sparc64",
)))]
mod ioc {
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;
    pub const DIR_SHIFT: u32 = 30;
}

#[cfg(any(
    target_arch = "mips",
    target_arch = "mips32r6",
    target_arch = "mips64",
    target_arch = "mips64r6",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc",
    target_arch = "sparc64",
))]
mod ioc {
    pub const WRITE: u32 = 4;
    pub const READ: u32 = 2;
    pub const DIR_SHIFT: u32 = 29;
}

const IOC_WRITE: u32 = ioc::WRITE;
const IOC_READ: u32 = ioc::READ;
const SPI_IOC_MAGIC: u32 = b'k' as u32;

const fn encode_ioc(dir: u32, dir_shift: u32, nr: u32, size: usize) -> u32 {
    (dir << dir_shift) | ((size as u32) << 16) | (SPI_IOC_MAGIC << 8) | nr
}

const fn spi_ioc(dir: u32, nr: u32, size: usize) -> u32 {
    encode_ioc(dir, ioc::DIR_SHIFT, nr, size)
}

const SPI_IOC_WR_BITS_PER_WORD: u32 = spi_ioc(IOC_WRITE, 3, size_of::<u8>());
const SPI_IOC_RD_BITS_PER_WORD: u32 = spi_ioc(IOC_READ, 3, size_of::<u8>());
const SPI_IOC_WR_MAX_SPEED_HZ: u32 = spi_ioc(IOC_WRITE, 4, size_of::<u32>());
const SPI_IOC_RD_MAX_SPEED_HZ: u32 = spi_ioc(IOC_READ, 4, size_of::<u32>());
const SPI_IOC_WR_MODE32: u32 = spi_ioc(IOC_WRITE, 5, size_of::<u32>());
const SPI_IOC_RD_MODE32: u32 = spi_ioc(IOC_READ, 5, size_of::<u32>());

/// spidev device. Each `write` is one half-duplex transfer of the whole buffer.
pub struct SpiDevice {
    file: File,
    settings: SpiSettings,
}

impl SpiDevice {
    pub fn open(settings: &SpiSettings) -> Result<Self, BusError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&settings.device)
            .map_err(|source| BusError::Open { path: settings.device.clone(), source })?;

        let mut dev = SpiDevice { file, settings: settings.clone() };
        dev.configure()?;
        Ok(dev)
    }

    /// Effective settings as read back from the driver
    pub fn settings(&self) -> &SpiSettings {
        &self.settings
    }

    fn configure(&mut self) -> Result<(), BusError> {
        let mut mode = self.settings.mode;
        ioctl(&self.file, SPI_IOC_WR_MODE32, &mut mode, "set spi mode")?;
        ioctl(&self.file, SPI_IOC_RD_MODE32, &mut mode, "get spi mode")?;

        let mut bits = self.settings.bits_per_word;
        ioctl(&self.file, SPI_IOC_WR_BITS_PER_WORD, &mut bits, "set bits per word")?;
        ioctl(&self.file, SPI_IOC_RD_BITS_PER_WORD, &mut bits, "get bits per word")?;

        let mut speed = self.settings.speed_hz;
        ioctl(&self.file, SPI_IOC_WR_MAX_SPEED_HZ, &mut speed, "set max speed hz")?;
        ioctl(&self.file, SPI_IOC_RD_MAX_SPEED_HZ, &mut speed, "get max speed hz")?;

        self.settings.mode = mode;
        self.settings.bits_per_word = bits;
        self.settings.speed_hz = speed;

        debug!(mode = format_args!("0x{:x}", mode), bits, speed_hz = speed, "spi configured");
        Ok(())
    }
}

fn ioctl<T>(file: &File, request: u32, value: &mut T, what: &'static str) -> Result<(), BusError> {
    // SAFETY: every SPI_IOC_* request above is encoded with size_of::<T>() of
    // the value it is paired with, and the pointer is valid for that size.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, value as *mut T) };
    if ret == -1 {
        return Err(BusError::Configure { what, source: std::io::Error::last_os_error() });
    }
    Ok(())
}

impl DuplexChannel for SpiDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn read_byte(&mut self) -> std::io::Result<u8> {
        let mut buf = [0u8; 1];
        match self.file.read(&mut buf)? {
            1 => Ok(buf[0]),
            _ => Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "spi read returned no data")),
        }
    }
}

// ============================================================================
// UART Implementation
// ============================================================================

#[derive(Debug, Clone)]
pub struct UartSettings {
    pub port: String,
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub read_timeout: Duration,
}

/// Peripheral reached through a serial bridge, wrapping the serialport crate
pub struct UartDevice {
    port: Box<dyn SerialPortTrait>,
}

impl UartDevice {
    pub fn open(settings: &UartSettings) -> Result<Self, BusError> {
        let port = serialport::new(&settings.port, settings.baud)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .timeout(settings.read_timeout)
            .open()?;

        Ok(UartDevice { port })
    }
}

impl DuplexChannel for UartDevice {
    // A UART accepts partial writes routinely, so the whole buffer is pushed
    // before reporting the count.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(buf.len())
    }

    fn read_byte(&mut self) -> std::io::Result<u8> {
        let mut buf = [0u8; 1];
        self.port.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

// ============================================================================
// UART setting parsers (CLI strings and numbers to serialport types)
// ============================================================================

fn invalid(what: &'static str, value: impl ToString, expected: &'static str) -> BusError {
    BusError::InvalidSetting { what, value: value.to_string(), expected }
}

pub fn parse_data_bits(bits: u8) -> Result<DataBits, BusError> {
    let data_bits = match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => return Err(invalid("data bits", other, "5, 6, 7 or 8")),
    };
    Ok(data_bits)
}

pub fn parse_parity(parity: &str) -> Result<Parity, BusError> {
    if parity.eq_ignore_ascii_case("none") {
        Ok(Parity::None)
    } else if parity.eq_ignore_ascii_case("odd") {
        Ok(Parity::Odd)
    } else if parity.eq_ignore_ascii_case("even") {
        Ok(Parity::Even)
    } else {
        Err(invalid("parity", parity, "none, odd or even"))
    }
}

pub fn parse_stop_bits(bits: u8) -> Result<StopBits, BusError> {
    let stop_bits = match bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => return Err(invalid("stop bits", other, "1 or 2")),
    };
    Ok(stop_bits)
}

// ============================================================================
// Mock Channel for Testing
// ============================================================================

#[cfg(test)]
pub struct MockChannel {
    // Bytes returned by read_byte (None = I/O error)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    // (write call index, bytes accepted) pairs simulating a short write
    truncations: Vec<(usize, usize)>,
    write_calls: usize,
    // When each write call arrived
    pub write_times: Vec<Instant>,
}

#[cfg(test)]
impl MockChannel {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockChannel {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
            truncations: Vec::new(),
            write_calls: 0,
            write_times: Vec::new(),
        }
    }

    pub fn write_log(&self) -> &[u8] {
        &self.write_log
    }

    /// Make write call number `call` accept only `len` bytes
    pub fn truncate_write(mut self, call: usize, len: usize) -> Self {
        self.truncations.push((call, len));
        self
    }
}

#[cfg(test)]
impl DuplexChannel for MockChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let call = self.write_calls;
        self.write_calls += 1;
        self.write_times.push(Instant::now());

        let accepted = self
            .truncations
            .iter()
            .find(|(c, _)| *c == call)
            .map_or(buf.len(), |(_, len)| (*len).min(buf.len()));

        self.write_log.extend_from_slice(&buf[..accepted]);
        Ok(accepted)
    }

    fn read_byte(&mut self) -> std::io::Result<u8> {
        if self.read_pos >= self.read_buffer.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let response = self.read_buffer[self.read_pos];
        self.read_pos += 1;
        response.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Mock bus error"))
    }
}

#[cfg(test)]
impl Drop for MockChannel {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockChannel dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert!(
            self.write_log == self.expected_writes,
            "MockChannel write log mismatch! Expected {} bytes, got {} bytes",
            self.expected_writes.len(),
            self.write_log.len()
        );
    }
}
