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

//! Wire constants for the framed push protocol

/// Payload bytes carried by every frame
pub const PAYLOAD_LEN: usize = 2048;

/// Total frame length: header (2) + sequence id (2) + payload + CRC-32 (4)
pub const FRAME_LEN: usize = 2056;

/// First header byte
pub const HEADER_HIGH: u8 = 0x55;

/// Second header byte
pub const HEADER_LOW: u8 = 0xAA;

/// Offset of the big-endian sequence id
pub const SEQ_OFFSET: usize = 2;

/// Offset of the payload field
pub const PAYLOAD_OFFSET: usize = 4;

/// Offset of the little-endian CRC-32 of the payload field
pub const CRC_OFFSET: usize = PAYLOAD_OFFSET + PAYLOAD_LEN;

/// Fill byte for the unused tail of a short final chunk
pub const PAD: u8 = 0xFF;

/// Byte clocked out while polling for the acknowledgment
pub const POLL_DUMMY: u8 = 0x00;

/// Peripheral accepted the frame
pub const ACK: u8 = 0x06;

/// Peripheral rejected the frame
pub const NACK: u8 = 0x15;

/// Line idle low - peripheral has not answered yet
pub const PENDING_LOW: u8 = 0x00;

/// Line idle high - peripheral has not answered yet
pub const PENDING_HIGH: u8 = 0xFF;

/// First sequence id of a session
pub const FIRST_SEQ_ID: u16 = 1;

/// Classification of one byte read back during the acknowledgment poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckByte {
    Pending,
    Ack,
    Nack,
    Unknown(u8),
}

impl From<u8> for AckByte {
    fn from(byte: u8) -> Self {
        match byte {
            PENDING_LOW | PENDING_HIGH => AckByte::Pending,
            ACK => AckByte::Ack,
            NACK => AckByte::Nack,
            other => AckByte::Unknown(other),
        }
    }
}
