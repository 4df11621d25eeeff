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

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use crate::bus::DuplexChannel;
use crate::checksum::Crc32;
use crate::config::LinkConfig;
use crate::gpio::SignalLine;
use crate::packet::{self, PacketError};
use crate::protocol::*;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("can't open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("packet {seq_id} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        seq_id: u16,
        attempts: u32,
        #[source]
        last: PacketError,
    },
}

#[derive(Debug)]
pub enum TransferStatus {
    Success,
    Failed(TransferError),
}

/// Summary of one file transfer session
#[derive(Debug)]
pub struct TransferReport {
    pub status: TransferStatus,
    /// Chunks acknowledged by the peripheral
    pub packet_count: u32,
    /// Sequence id the next chunk would have used
    pub next_seq_id: u16,
    pub bytes_read: u64,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn is_success(&self) -> bool {
        matches!(self.status, TransferStatus::Success)
    }

    pub fn throughput(&self) -> Option<f64> {
        throughput_kib_per_sec(self.packet_count, self.elapsed)
    }

    /// One-line outcome for the session log
    pub fn summary(&self) -> &'static str {
        match self.status {
            TransferStatus::Success => "all packets sent",
            TransferStatus::Failed(_) => "transfer stopped before end of file",
        }
    }
}

/// KiB/s of payload delivered, or None when no time has elapsed
pub fn throughput_kib_per_sec(packets: u32, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(packets as f64 * (PAYLOAD_LEN / 1024) as f64 / secs)
    } else {
        None
    }
}

// ============================================================================
// Session
// ============================================================================

struct TransferSession<'a> {
    channel: &'a mut dyn DuplexChannel,
    line: &'a mut dyn SignalLine,
    config: &'a LinkConfig,
    crc: Crc32,
    file: File,
    seq_id: u16,
    packet_count: u32,
    bytes_read: u64,
}

impl<'a> TransferSession<'a> {
    fn new(
        channel: &'a mut dyn DuplexChannel,
        line: &'a mut dyn SignalLine,
        config: &'a LinkConfig,
        file: File,
        first_seq_id: u16,
    ) -> Self {
        TransferSession {
            channel,
            line,
            config,
            crc: Crc32::new(),
            file,
            seq_id: first_seq_id,
            packet_count: 0,
            bytes_read: 0,
        }
    }

    fn run(&mut self) -> Result<(), TransferError> {
        let mut buffer = [PAD; PAYLOAD_LEN];

        loop {
            let len = read_chunk(&mut self.file, &mut buffer).map_err(TransferError::Read)?;
            if len == 0 {
                return Ok(());
            }

            if len < PAYLOAD_LEN {
                buffer[len..].fill(PAD);
            }
            self.bytes_read += len as u64;

            self.send_with_retry(&buffer)?;

            self.packet_count += 1;
            self.seq_id = self.seq_id.wrapping_add(1);
        }
    }

    fn into_report(mut self, started: Instant) -> TransferReport {
        let status = match self.run() {
            Ok(()) => TransferStatus::Success,
            Err(e) => TransferStatus::Failed(e),
        };

        TransferReport {
            status,
            packet_count: self.packet_count,
            next_seq_id: self.seq_id,
            bytes_read: self.bytes_read,
            elapsed: started.elapsed(),
        }
    }

    fn send_with_retry(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match packet::send(&mut *self.channel, &mut *self.line, self.config, &self.crc, self.seq_id, chunk) {
                Ok(()) => {
                    debug!(seq_id = self.seq_id, attempt, "packet delivered");
                    return Ok(());
                }
                Err(e) if attempt >= self.config.max_attempts => {
                    error!(seq_id = self.seq_id, attempts = attempt, "giving up on packet: {}", e);
                    return Err(TransferError::RetriesExhausted {
                        seq_id: self.seq_id,
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(seq_id = self.seq_id, attempt, "attempt failed, retrying: {}", e);
                    if !self.config.retry_delay.is_zero() {
                        std::thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }
    }
}

// Fill the buffer unless end of file comes first
fn read_chunk(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Push a whole file to the peripheral, one acknowledged frame at a time.
///
/// Only a failure to open the file is returned as `Err`; everything that
/// happens once the session is running ends up in the report's status so the
/// caller still gets packet counts and timing for a partial transfer.
pub fn transfer(
    channel: &mut dyn DuplexChannel,
    line: &mut dyn SignalLine,
    config: &LinkConfig,
    path: &Path,
) -> Result<TransferReport, TransferError> {
    let started = Instant::now();

    let file = File::open(path).map_err(|source| TransferError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let report = TransferSession::new(channel, line, config, file, FIRST_SEQ_ID).into_report(started);

    info!(packets = report.packet_count, elapsed = ?report.elapsed, "{}", report.summary());
    if let Some(rate) = report.throughput() {
        info!("throughput {:.1} KiB/s", rate);
    }

    Ok(report)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use crate::bus::MockChannel;
    use crate::frame;
    use crate::gpio::MockSignalLine;

    fn test_config() -> LinkConfig {
        LinkConfig {
            settle_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            ..LinkConfig::default()
        }
    }

    fn input_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    fn acked_frame(seq_id: u16, chunk: &[u8]) -> Vec<u8> {
        let mut bytes = frame::encode(&Crc32::new(), seq_id, chunk).unwrap().to_vec();
        bytes.push(POLL_DUMMY);
        bytes
    }

    fn test_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    // Decode every frame in a log of frames that were each acked on the first poll
    fn frames_on_bus(log: &[u8]) -> Vec<frame::DecodedFrame> {
        let crc = Crc32::new();
        log.chunks(FRAME_LEN + 1)
            .map(|sent| {
                assert_eq!(sent.len(), FRAME_LEN + 1);
                assert_eq!(sent[FRAME_LEN], POLL_DUMMY);
                frame::decode(&crc, &sent[..FRAME_LEN]).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_transfer_5000_bytes() {
        let content = test_content(5000);
        let file = input_file(&content);

        let mut expected_writes = Vec::new();
        expected_writes.extend(acked_frame(1, &content[..2048]));
        expected_writes.extend(acked_frame(2, &content[2048..4096]));
        expected_writes.extend(acked_frame(3, &content[4096..]));

        let mut channel = MockChannel::new(vec![Some(ACK); 3], expected_writes);
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &test_config(), file.path()).unwrap();

        assert!(report.is_success());
        assert_eq!(report.packet_count, 3);
        assert_eq!(report.next_seq_id, 4);
        assert_eq!(report.bytes_read, 5000);
        assert_eq!(line.levels, vec![false, true, false, true, false, true]);

        let frames = frames_on_bus(channel.write_log());
        let ids: Vec<u16> = frames.iter().map(|f| f.seq_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(&frames[0].payload[..], &content[..2048]);
        assert_eq!(&frames[1].payload[..], &content[2048..4096]);
        assert_eq!(&frames[2].payload[..904], &content[4096..]);
        assert!(frames[2].payload[904..].iter().all(|&b| b == PAD));
    }

    #[test]
    fn test_last_chunk_padded() {
        let content = test_content(904);
        let file = input_file(&content);

        let mut padded = content.clone();
        padded.resize(PAYLOAD_LEN, PAD);

        let mut channel = MockChannel::new(vec![Some(ACK)], acked_frame(1, &padded));
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &test_config(), file.path()).unwrap();

        assert!(report.is_success());
        assert_eq!(report.packet_count, 1);
    }

    #[test]
    fn test_retry_reuses_sequence_id() {
        let content = test_content(3000);
        let file = input_file(&content);

        let responses = vec![Some(NACK), Some(0x00), Some(ACK), Some(ACK)];

        let mut expected_writes = Vec::new();
        expected_writes.extend(acked_frame(1, &content[..2048]));
        expected_writes.extend(acked_frame(1, &content[..2048]));
        expected_writes.push(POLL_DUMMY);
        expected_writes.extend(acked_frame(2, &content[2048..]));

        let mut channel = MockChannel::new(responses, expected_writes);
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &test_config(), file.path()).unwrap();

        assert!(report.is_success());
        assert_eq!(report.packet_count, 2);
        assert_eq!(report.next_seq_id, 3);
    }

    #[test]
    fn test_three_nacks_abort_transfer() {
        let content = test_content(3000);
        let file = input_file(&content);

        let mut expected_writes = Vec::new();
        for _ in 0..3 {
            expected_writes.extend(acked_frame(1, &content[..2048]));
        }

        let mut channel = MockChannel::new(vec![Some(NACK); 3], expected_writes);
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &test_config(), file.path()).unwrap();

        match report.status {
            TransferStatus::Failed(TransferError::RetriesExhausted { seq_id: 1, attempts: 3, last: PacketError::Nack }) => {}
            other => panic!("unexpected status: {:?}", other),
        }
        assert_eq!(report.packet_count, 0);
        assert_eq!(report.next_seq_id, 1);
    }

    #[test]
    fn test_short_writes_abort_transfer() {
        let content = test_content(5000);
        let file = input_file(&content);

        let frame = frame::encode(&Crc32::new(), 1, &content[..2048]).unwrap();
        let mut expected_writes = Vec::new();
        for _ in 0..3 {
            expected_writes.extend_from_slice(&frame[..100]);
        }

        let mut channel = MockChannel::new(vec![], expected_writes)
            .truncate_write(0, 100)
            .truncate_write(1, 100)
            .truncate_write(2, 100);
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &test_config(), file.path()).unwrap();

        assert!(matches!(
            report.status,
            TransferStatus::Failed(TransferError::RetriesExhausted { last: PacketError::ShortWrite { written: 100, .. }, .. })
        ));
        assert_eq!(report.packet_count, 0);
    }

    #[test]
    fn test_mixed_failures_abort_transfer() {
        let content = test_content(10);
        let file = input_file(&content);

        let frame = frame::encode(&Crc32::new(), 1, &content).unwrap();
        let mut expected_writes = frame[..10].to_vec();
        expected_writes.extend(acked_frame(1, &content));
        expected_writes.extend_from_slice(&frame[..10]);

        let mut channel = MockChannel::new(vec![Some(NACK)], expected_writes)
            .truncate_write(0, 10)
            .truncate_write(3, 10);
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &test_config(), file.path()).unwrap();

        assert!(!report.is_success());
        assert_eq!(report.packet_count, 0);
    }

    #[test]
    fn test_retry_and_settle_delays() {
        let content = test_content(10);
        let file = input_file(&content);
        let settle = Duration::from_millis(20);
        let retry = Duration::from_millis(150);
        let config = LinkConfig {
            settle_delay: settle,
            retry_delay: retry,
            ..LinkConfig::default()
        };

        let mut expected_writes = Vec::new();
        for _ in 0..3 {
            expected_writes.extend(acked_frame(1, &content));
        }
        let mut channel = MockChannel::new(vec![Some(NACK); 3], expected_writes);
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &config, file.path()).unwrap();

        assert!(!report.is_success());
        // Three settles, and a retry delay between attempts but not after the last
        assert!(report.elapsed >= settle * 3 + retry * 2);
        assert!(report.elapsed < settle * 3 + retry * 3);

        // Writes alternate frame, poll; frames sit at 0, 2 and 4
        let times = &channel.write_times;
        assert_eq!(times.len(), 6);
        for pair in [(0, 2), (2, 4)] {
            assert!(times[pair.1].duration_since(times[pair.0]) >= retry + settle);
        }
        // Each new attempt selects only after the retry delay
        assert!(line.set_times[2].duration_since(line.set_times[1]) >= retry);
        assert!(line.set_times[4].duration_since(line.set_times[3]) >= retry);
    }

    #[test]
    fn test_sequence_id_wraps_to_zero() {
        let content = test_content(3000);
        let file = input_file(&content);

        let mut expected_writes = acked_frame(u16::MAX, &content[..2048]);
        expected_writes.extend(acked_frame(0, &content[2048..]));
        let mut channel = MockChannel::new(vec![Some(ACK); 2], expected_writes);
        let mut line = MockSignalLine::new();
        let config = test_config();

        let session = TransferSession::new(&mut channel, &mut line, &config, file.reopen().unwrap(), u16::MAX);
        let report = session.into_report(Instant::now());

        assert!(report.is_success());
        assert_eq!(report.packet_count, 2);
        assert_eq!(report.next_seq_id, 1);

        let ids: Vec<u16> = frames_on_bus(channel.write_log()).iter().map(|f| f.seq_id).collect();
        assert_eq!(ids, vec![u16::MAX, 0]);
    }

    #[test]
    fn test_summary_follows_status() {
        let failed = TransferReport {
            status: TransferStatus::Failed(TransferError::Read(std::io::Error::other("gone"))),
            packet_count: 4,
            next_seq_id: 5,
            bytes_read: 9000,
            elapsed: Duration::from_millis(10),
        };
        assert_eq!(failed.summary(), "transfer stopped before end of file");

        let done = TransferReport { status: TransferStatus::Success, ..failed };
        assert_eq!(done.summary(), "all packets sent");
    }

    #[test]
    fn test_empty_file_is_success() {
        let file = input_file(b"");
        let mut channel = MockChannel::new(vec![], vec![]);
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &test_config(), file.path()).unwrap();

        assert!(report.is_success());
        assert_eq!(report.packet_count, 0);
        assert_eq!(report.next_seq_id, 1);
        assert!(line.levels.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        let mut channel = MockChannel::new(vec![], vec![]);
        let mut line = MockSignalLine::new();

        match transfer(&mut channel, &mut line, &test_config(), &path) {
            Err(TransferError::Open { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected open error, got {:?}", other),
        }
    }

    #[test]
    fn test_read_error_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = MockChannel::new(vec![], vec![]);
        let mut line = MockSignalLine::new();

        let report = transfer(&mut channel, &mut line, &test_config(), dir.path()).unwrap();

        assert!(matches!(report.status, TransferStatus::Failed(TransferError::Read(_))));
    }

    #[test]
    fn test_throughput_requires_elapsed_time() {
        assert_eq!(throughput_kib_per_sec(10, Duration::ZERO), None);
        assert_eq!(throughput_kib_per_sec(0, Duration::ZERO), None);
        assert_eq!(throughput_kib_per_sec(10, Duration::from_secs(2)), Some(10.0));
    }
}
