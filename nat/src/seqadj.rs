// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! TCP sequence and acknowledgment number adjustment.
//!
//! A payload rewrite that changes the length of a segment shifts the sequence space of every
//! later byte of that direction. The shift is recorded in a [`SeqOffset`] and applied to every
//! following packet: sequence numbers of the same direction are moved forward, acknowledgment
//! numbers of the opposite direction are moved back.

use net::buffer::PacketBufferMut;
use net::packet::{Packet, PacketError};
use net::tcp::TcpFlags;
use tracing::trace;

/// Returns true if sequence number `seq1` comes strictly after `seq2`, modulo 2^32.
#[must_use]
#[allow(clippy::cast_possible_wrap)] // the sign of the wrapped distance is the point
pub fn after(seq1: u32, seq2: u32) -> bool {
    (seq2.wrapping_sub(seq1) as i32) < 0
}

/// Sequence shift of one direction of a connection.
///
/// Only the most recent length-changing rewrite is tracked: packets starting after
/// `correction_pos` carry `offset_after`, all others `offset_before`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeqOffset {
    pub correction_pos: u32,
    pub offset_before: i32,
    pub offset_after: i32,
}

/// Outcome of recording a rewrite in a [`SeqOffset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqEdit {
    /// The rewrite did not change the segment length
    Unchanged,
    /// The record now describes this rewrite
    Recorded,
    /// Same starting sequence as the recorded rewrite: already accounted for
    Retransmit,
    /// The rewrite starts before the recorded one; the record cannot describe both
    Stale,
}

#[derive(Debug, thiserror::Error)]
pub enum SeqAdjError {
    #[error(transparent)]
    Packet(#[from] PacketError),
}

impl SeqOffset {
    /// Returns true if the record never shifts anything.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.offset_before == 0 && self.offset_after == 0
    }

    /// Offset to add to a sequence number of this direction
    #[must_use]
    pub fn seq_offset(&self, seq: u32) -> i32 {
        if after(seq, self.correction_pos) {
            self.offset_after
        } else {
            self.offset_before
        }
    }

    /// Offset to subtract from an acknowledgment number of the opposite direction.
    ///
    /// The acknowledgment is in the translated space; it is compared to `correction_pos` after
    /// removing the shift that was in effect before the correction.
    #[must_use]
    pub fn ack_offset(&self, ack: u32) -> i32 {
        if after(
            ack.wrapping_add_signed(self.offset_before.wrapping_neg()),
            self.correction_pos,
        ) {
            self.offset_after
        } else {
            self.offset_before
        }
    }

    /// Record a rewrite starting at sequence number `seq` that changed the segment length by
    /// `delta` octets.
    pub fn record_edit(&mut self, seq: u32, delta: i32) -> SeqEdit {
        if delta == 0 {
            return SeqEdit::Unchanged;
        }
        if self.offset_before == self.offset_after || after(seq, self.correction_pos) {
            self.correction_pos = seq;
            self.offset_before = self.offset_after;
            self.offset_after = self.offset_after.wrapping_add(delta);
            SeqEdit::Recorded
        } else if seq == self.correction_pos {
            SeqEdit::Retransmit
        } else {
            SeqEdit::Stale
        }
    }
}

/// Shift the sequence number of `packet` by `this` and its acknowledgment number (when the ACK
/// flag is set) by `other`, the record of the opposite direction.
///
/// The TCP checksum is updated incrementally. Nothing is written when neither number moves.
///
/// # Errors
///
/// Fails if the packet is not a valid TCP segment or its buffer cannot be made exclusive.
pub fn adjust<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
    this: &SeqOffset,
    other: &SeqOffset,
) -> Result<(), SeqAdjError> {
    if this.is_identity() && other.is_identity() {
        return Ok(());
    }
    let (seq, ack, flags) = {
        let tcp = packet.tcp()?;
        (tcp.sequence(), tcp.acknowledgment(), tcp.flags())
    };
    let new_seq = seq.wrapping_add_signed(this.seq_offset(seq));
    let new_ack = if flags.contains(TcpFlags::ACK) {
        ack.wrapping_add_signed(other.ack_offset(ack).wrapping_neg())
    } else {
        ack
    };
    if new_seq == seq && new_ack == ack {
        return Ok(());
    }
    let mut tcp = packet.tcp_mut()?;
    tcp.set_sequence(new_seq).set_acknowledgment(new_ack);
    trace!("adjusted seq {seq} -> {new_seq}, ack {ack} -> {new_ack}");
    Ok(())
}
