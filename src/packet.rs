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

//! Single-frame delivery: select, write, release, poll for the ack.

use std::marker::PhantomData;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace, warn};
use crate::bus::DuplexChannel;
use crate::checksum::Crc32;
use crate::config::LinkConfig;
use crate::frame::{self, FrameError};
use crate::gpio::SignalLine;
use crate::protocol::*;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("select line write failed: {0}")]
    SignalFault(#[source] std::io::Error),
    #[error("short frame write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("frame write failed: {0}")]
    Bus(#[source] std::io::Error),
    #[error("ack exchange failed: {0}")]
    AckIo(#[source] std::io::Error),
    #[error("NACK received")]
    Nack,
    #[error("unexpected ack byte 0x{0:02X}")]
    UnexpectedAck(u8),
    #[error("no ack after {polls} polls")]
    AckTimeout { polls: u32 },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ============================================================================
// States
// ============================================================================

pub struct Selecting;
pub struct Transmitting;
pub struct AwaitingAck;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Selecting,
    Transmitting,
    AwaitingAck,
    Acked,
    Nacked,
    Faulted,
}

/// How a packet attempt resolved
#[derive(Debug)]
pub enum Outcome {
    Acked,
    Nacked,
    Faulted(PacketError),
}

impl Outcome {
    pub fn phase(&self) -> Phase {
        match self {
            Outcome::Acked => Phase::Acked,
            Outcome::Nacked => Phase::Nacked,
            Outcome::Faulted(_) => Phase::Faulted,
        }
    }

    pub fn into_result(self) -> Result<(), PacketError> {
        match self {
            Outcome::Acked => Ok(()),
            Outcome::Nacked => Err(PacketError::Nack),
            Outcome::Faulted(e) => Err(e),
        }
    }
}

pub enum Step<'a> {
    Next(Box<dyn PacketState<'a> + 'a>),
    Done(Outcome),
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct PacketFsm<'a, State> {
    state: PhantomData<State>,
    channel: &'a mut dyn DuplexChannel,
    line: &'a mut dyn SignalLine,
    config: &'a LinkConfig,
    crc: &'a Crc32,
    seq_id: u16,
    payload: &'a [u8],
    polls: u32,
    poll_started: Option<Instant>,
}

// ============================================================================
// Trait
// ============================================================================

pub trait PacketState<'a> {
    fn phase(&self) -> Phase;

    fn step(self: Box<Self>) -> Step<'a>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<'a, S> PacketFsm<'a, S> {
    fn transition<T>(self) -> Box<PacketFsm<'a, T>> {
        Box::new(PacketFsm {
            state: PhantomData,
            channel: self.channel,
            line: self.line,
            config: self.config,
            crc: self.crc,
            seq_id: self.seq_id,
            payload: self.payload,
            polls: self.polls,
            poll_started: self.poll_started,
        })
    }

    // Fault while the peripheral is still selected: try to release the line
    // so it does not stay selected into the retry delay.
    fn fault_selected(mut self, err: PacketError) -> Step<'a> {
        if let Err(e) = self.line.set(true) {
            warn!(seq_id = self.seq_id, "could not release select line after fault: {}", e);
        }
        Step::Done(Outcome::Faulted(err))
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl<'a> PacketState<'a> for PacketFsm<'a, Selecting> {
    fn phase(&self) -> Phase {
        Phase::Selecting
    }

    fn step(self: Box<Self>) -> Step<'a> {
        let mut fsm = *self;
        if let Err(e) = fsm.line.set(false) {
            return Step::Done(Outcome::Faulted(PacketError::SignalFault(e)));
        }

        if !fsm.config.settle_delay.is_zero() {
            std::thread::sleep(fsm.config.settle_delay);
        }

        Step::Next(fsm.transition::<Transmitting>())
    }
}

impl<'a> PacketState<'a> for PacketFsm<'a, Transmitting> {
    fn phase(&self) -> Phase {
        Phase::Transmitting
    }

    fn step(self: Box<Self>) -> Step<'a> {
        let mut fsm = *self;

        let frame = match frame::encode(fsm.crc, fsm.seq_id, fsm.payload) {
            Ok(frame) => frame,
            Err(e) => return fsm.fault_selected(e.into()),
        };
        debug!(
            seq_id = fsm.seq_id,
            crc = format_args!("{:08X}", u32::from_le_bytes([
                frame[CRC_OFFSET], frame[CRC_OFFSET + 1], frame[CRC_OFFSET + 2], frame[CRC_OFFSET + 3],
            ])),
            "sending frame"
        );

        match fsm.channel.write(&frame) {
            Ok(FRAME_LEN) => {}
            Ok(written) => {
                return fsm.fault_selected(PacketError::ShortWrite { written, expected: FRAME_LEN });
            }
            Err(e) => return fsm.fault_selected(PacketError::Bus(e)),
        }

        if let Err(e) = fsm.line.set(true) {
            return Step::Done(Outcome::Faulted(PacketError::SignalFault(e)));
        }

        fsm.poll_started = Some(Instant::now());
        Step::Next(fsm.transition::<AwaitingAck>())
    }
}

impl<'a> PacketState<'a> for PacketFsm<'a, AwaitingAck> {
    fn phase(&self) -> Phase {
        Phase::AwaitingAck
    }

    fn step(self: Box<Self>) -> Step<'a> {
        let mut fsm = *self;

        let timed_out = match (fsm.config.ack_timeout, fsm.poll_started) {
            (Some(limit), Some(started)) => started.elapsed() >= limit,
            _ => false,
        };
        if fsm.polls >= fsm.config.ack_poll_limit || timed_out {
            return Step::Done(Outcome::Faulted(PacketError::AckTimeout { polls: fsm.polls }));
        }
        fsm.polls += 1;

        match fsm.channel.write(&[POLL_DUMMY]) {
            Ok(1) => {}
            Ok(_) => {
                let e = std::io::Error::new(std::io::ErrorKind::WriteZero, "poll byte not written");
                return Step::Done(Outcome::Faulted(PacketError::AckIo(e)));
            }
            Err(e) => return Step::Done(Outcome::Faulted(PacketError::AckIo(e))),
        }

        let byte = match fsm.channel.read_byte() {
            Ok(byte) => byte,
            Err(e) => return Step::Done(Outcome::Faulted(PacketError::AckIo(e))),
        };
        trace!(seq_id = fsm.seq_id, poll = fsm.polls, ack = format_args!("0x{:02X}", byte), "ack poll");

        match AckByte::from(byte) {
            AckByte::Pending => {
                if !fsm.config.ack_poll_interval.is_zero() {
                    std::thread::sleep(fsm.config.ack_poll_interval);
                }
                Step::Next(Box::new(fsm))
            }
            AckByte::Ack => {
                debug!(seq_id = fsm.seq_id, "ACK received");
                Step::Done(Outcome::Acked)
            }
            AckByte::Nack => {
                debug!(seq_id = fsm.seq_id, "NACK received");
                Step::Done(Outcome::Nacked)
            }
            AckByte::Unknown(other) => Step::Done(Outcome::Faulted(PacketError::UnexpectedAck(other))),
        }
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl<'a> PacketFsm<'a, Selecting> {
    pub fn new(
        channel: &'a mut dyn DuplexChannel,
        line: &'a mut dyn SignalLine,
        config: &'a LinkConfig,
        crc: &'a Crc32,
        seq_id: u16,
        payload: &'a [u8],
    ) -> Box<dyn PacketState<'a> + 'a> {
        Box::new(PacketFsm {
            state: PhantomData::<Selecting>,
            channel,
            line,
            config,
            crc,
            seq_id,
            payload,
            polls: 0,
            poll_started: None,
        })
    }
}

/// Deliver one frame and resolve it to ACK, NACK or a fault
pub fn send(
    channel: &mut dyn DuplexChannel,
    line: &mut dyn SignalLine,
    config: &LinkConfig,
    crc: &Crc32,
    seq_id: u16,
    payload: &[u8],
) -> Result<(), PacketError> {
    let mut state = PacketFsm::new(channel, line, config, crc, seq_id, payload);

    loop {
        let from = state.phase();
        match state.step() {
            Step::Next(next) => {
                if next.phase() != from {
                    trace!(seq_id, ?from, to = ?next.phase(), "packet transition");
                }
                state = next;
            }
            Step::Done(outcome) => {
                trace!(seq_id, ?from, to = ?outcome.phase(), "packet resolved");
                return outcome.into_result();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
