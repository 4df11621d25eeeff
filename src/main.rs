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

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spilink::bus::{self, BusError, DuplexChannel, SpiDevice, SpiSettings, UartDevice, UartSettings};
use spilink::config::LinkConfig;
use spilink::gpio::SysfsGpio;
use spilink::transfer::{self, TransferStatus};

#[derive(Parser)]
#[command(name = "spilink")]
#[command(about = "Push a file to a peripheral as framed, acknowledged packets", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// File to send
    file: PathBuf,

    /// GPIO number of the select line
    #[arg(long, default_value = "59", value_name = "N")]
    gpio: u32,

    /// Directory holding exported GPIO lines
    #[arg(long, default_value = "/sys/class/gpio", value_name = "DIR")]
    gpio_root: PathBuf,

    /// Delay in microseconds between selecting the peripheral and writing a frame
    #[arg(long, default_value = "1000", value_name = "US")]
    settle_us: u64,

    /// Delay in milliseconds after a failed attempt
    #[arg(long, default_value = "20", value_name = "MS")]
    retry_delay_ms: u64,

    /// Attempts per packet before giving up
    #[arg(long, default_value = "3", value_name = "N")]
    attempts: u32,

    /// Maximum poll exchanges while waiting for an ACK
    #[arg(long, default_value = "1000000", value_name = "N")]
    ack_poll_limit: u32,

    /// Give up waiting for an ACK after this many milliseconds
    #[arg(long, value_name = "MS")]
    ack_timeout_ms: Option<u64>,

    /// Delay in microseconds between ACK poll exchanges
    #[arg(long, default_value = "0", value_name = "US")]
    ack_poll_interval_us: u64,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    bus: Bus,
}

#[derive(Subcommand)]
enum Bus {
    /// Talk to the peripheral through a spidev device
    Spi {
        /// SPI device to use
        #[arg(short = 'D', long, default_value = "/dev/spidev1.0")]
        device: PathBuf,

        /// Max clock speed (Hz)
        #[arg(short, long, default_value = "15000000")]
        speed: u32,

        /// SPI mode (0-3, plus spidev mode flags)
        #[arg(long, default_value = "0")]
        mode: u32,

        /// Bits per word
        #[arg(long, default_value = "8", value_name = "BITS")]
        bits: u8,
    },
    /// Talk to the peripheral through a serial bridge
    Uart {
        /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
        #[arg(short, long)]
        port: String,

        /// Baud rate
        #[arg(short, long, default_value = "115200")]
        baud: u32,

        /// Data bits (5, 6, 7, or 8)
        #[arg(long, default_value = "8", value_name = "BITS")]
        data_bits: u8,

        /// Parity (none, odd, or even)
        #[arg(long, default_value = "none")]
        parity: String,

        /// Stop bits (1 or 2)
        #[arg(long, default_value = "1", value_name = "BITS")]
        stop_bits: u8,

        /// Read timeout in milliseconds for each ACK poll byte
        #[arg(long, default_value = "100", value_name = "MS")]
        read_timeout_ms: u64,
    },
}

impl Cli {
    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            gpio_line: self.gpio,
            gpio_root: self.gpio_root.clone(),
            settle_delay: Duration::from_micros(self.settle_us),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_attempts: self.attempts,
            ack_poll_limit: self.ack_poll_limit,
            ack_timeout: self.ack_timeout_ms.map(Duration::from_millis),
            ack_poll_interval: Duration::from_micros(self.ack_poll_interval_us),
        }
    }
}

fn open_bus(bus: &Bus) -> Result<Box<dyn DuplexChannel>, BusError> {
    match bus {
        Bus::Spi { device, speed, mode, bits } => {
            let settings = SpiSettings {
                device: device.clone(),
                mode: *mode,
                bits_per_word: *bits,
                speed_hz: *speed,
            };
            info!("Opening SPI device: {}", device.display());
            let dev = SpiDevice::open(&settings)?;
            let actual = dev.settings();
            info!(
                "spi mode: 0x{:x}, bits per word: {}, max speed: {} Hz ({} kHz)",
                actual.mode, actual.bits_per_word, actual.speed_hz, actual.speed_hz / 1000
            );
            Ok(Box::new(dev))
        }
        Bus::Uart { port, baud, data_bits, parity, stop_bits, read_timeout_ms } => {
            let settings = UartSettings {
                port: port.clone(),
                baud: *baud,
                data_bits: bus::parse_data_bits(*data_bits)?,
                parity: bus::parse_parity(parity)?,
                stop_bits: bus::parse_stop_bits(*stop_bits)?,
                read_timeout: Duration::from_millis(*read_timeout_ms),
            };
            info!("Opening serial port: {}", port);
            info!(
                "Settings: {} baud, {:?}, {:?}, {:?}",
                settings.baud, settings.data_bits, settings.parity, settings.stop_bits
            );
            let dev = UartDevice::open(&settings)?;
            Ok(Box::new(dev))
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.link_config();
    if let Err(e) = config.validate() {
        error!("Error: {}", e);
        std::process::exit(1);
    }

    let mut channel = match open_bus(&cli.bus) {
        Ok(channel) => channel,
        Err(e) => {
            error!("Failed to open bus: {}", e);
            std::process::exit(1);
        }
    };

    let mut line = SysfsGpio::new(&config.gpio_root, config.gpio_line);

    info!("Sending file: {}", cli.file.display());
    let report = match transfer::transfer(channel.as_mut(), &mut line, &config, &cli.file) {
        Ok(report) => report,
        Err(e) => {
            error!("Send failed: {}", e);
            std::process::exit(1);
        }
    };

    match report.status {
        TransferStatus::Success => {
            info!(
                "File sent successfully: {} packets, {} bytes in {:.3}s",
                report.packet_count,
                report.bytes_read,
                report.elapsed.as_secs_f64()
            );
        }
        TransferStatus::Failed(e) => {
            error!("Send failed after {} packets: {}", report.packet_count, e);
            std::process::exit(1);
        }
    }
}
