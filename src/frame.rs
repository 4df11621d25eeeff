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

//! Frame codec
//!
//! ```text
//! 0      1      2..4        4..2052           2052..2056
//! 0x55   0xAA   seq id BE   payload (0xFF pad) CRC-32 LE of payload
//! ```

use thiserror::Error;
use crate::checksum::Crc32;
use crate::protocol::*;

pub type Frame = [u8; FRAME_LEN];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {max}-byte frame payload", max = PAYLOAD_LEN)]
    PayloadTooLong(usize),
    #[error("frame is {0} bytes, expected {len}", len = FRAME_LEN)]
    BadLength(usize),
    #[error("bad frame header {0:02X} {1:02X}")]
    BadHeader(u8, u8),
    #[error("checksum mismatch: frame carries {stored:08X}, payload hashes to {computed:08X}")]
    BadChecksum { stored: u32, computed: u32 },
}

/// Frame contents after a successful [`decode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub seq_id: u16,
    pub payload: [u8; PAYLOAD_LEN],
}

/// Build a frame. Short payloads are padded with 0xFF up to the payload length.
pub fn encode(crc: &Crc32, seq_id: u16, payload: &[u8]) -> Result<Frame, FrameError> {
    if payload.len() > PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLong(payload.len()));
    }

    let mut frame = [PAD; FRAME_LEN];
    frame[0] = HEADER_HIGH;
    frame[1] = HEADER_LOW;
    frame[SEQ_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&seq_id.to_be_bytes());
    frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);

    let sum = crc.checksum(&frame[PAYLOAD_OFFSET..CRC_OFFSET]);
    frame[CRC_OFFSET..].copy_from_slice(&sum.to_le_bytes());

    Ok(frame)
}

/// Parse and verify a frame as the peripheral would
pub fn decode(crc: &Crc32, bytes: &[u8]) -> Result<DecodedFrame, FrameError> {
    if bytes.len() != FRAME_LEN {
        return Err(FrameError::BadLength(bytes.len()));
    }
    if bytes[0] != HEADER_HIGH || bytes[1] != HEADER_LOW {
        return Err(FrameError::BadHeader(bytes[0], bytes[1]));
    }

    let seq_id = u16::from_be_bytes([bytes[SEQ_OFFSET], bytes[SEQ_OFFSET + 1]]);
    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(&bytes[PAYLOAD_OFFSET..CRC_OFFSET]);

    let stored = u32::from_le_bytes([
        bytes[CRC_OFFSET],
        bytes[CRC_OFFSET + 1],
        bytes[CRC_OFFSET + 2],
        bytes[CRC_OFFSET + 3],
    ]);
    let computed = crc.checksum(&payload);
    if stored != computed {
        return Err(FrameError::BadChecksum { stored, computed });
    }

    Ok(DecodedFrame { seq_id, payload })
}

// ============================================================================
// Tests
// ============================================================================
