// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Payload rewriting for helpers.
//!
//! A rewrite replaces a range of the transport payload with octets of any length. The datagram
//! is resized in place (or copied if its buffer is shared or too small), its lengths and
//! checksums are recomputed, and for TCP the length change is recorded in the connection's
//! sequence records.

use crate::conntrack::Connection;
use crate::seqadj::SeqEdit;
use crate::stats;
use crate::tuple::ConnDirection;
use net::buffer::PacketBufferMut;
use net::checksum::{ChecksumError, ChecksumMut};
use net::packet::{Packet, PacketError};
use net::udp::Udp;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum MangleError {
    #[error("range {offset}+{len} outside of a payload of {payload} octets")]
    OutOfBounds {
        offset: usize,
        len: usize,
        payload: usize,
    },
    #[error("rewrite would grow the datagram to {0} octets")]
    TooLong(usize),
    #[error(transparent)]
    Packet(PacketError),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
}

impl From<PacketError> for MangleError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::TooLong(len) => MangleError::TooLong(len),
            e => MangleError::Packet(e),
        }
    }
}

/// The first fragment of a datagram carries only part of its payload: nothing in it is
/// editable.
fn check_range(
    offset: usize,
    len: usize,
    payload: usize,
    more_fragments: bool,
) -> Result<(), MangleError> {
    match offset.checked_add(len) {
        Some(end) if end <= payload && !more_fragments => Ok(()),
        _ => Err(MangleError::OutOfBounds {
            offset,
            len,
            payload,
        }),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // both are at most 65535
fn delta(old_len: usize, new_len: usize) -> i32 {
    new_len as i32 - old_len as i32
}

/// Replace `match_len` octets at `match_offset` of the TCP payload of `packet` with
/// `replacement`.
///
/// The TCP checksum is recomputed over the whole segment. If the length changed, the sequence
/// record of `dir` is updated; the returned [`SeqEdit`] tells how.
///
/// # Errors
///
/// * [`MangleError::OutOfBounds`] if the range is not inside the payload, or the packet is the
///   first fragment of a datagram,
/// * [`MangleError::TooLong`] if the datagram would exceed 65535 octets,
/// * [`MangleError::Packet`] for malformed packets and buffer failures.
///
/// The packet is unmodified when an error is returned; the caller is expected to drop it.
pub fn mangle_tcp_packet<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
    conn: &Connection,
    dir: ConnDirection,
    match_offset: usize,
    match_len: usize,
    replacement: &[u8],
) -> Result<SeqEdit, MangleError> {
    let (seq, payload_start, payload_len) = {
        let tcp = packet.tcp()?;
        (
            tcp.sequence(),
            packet.header_len() + tcp.header_len(),
            tcp.payload().len(),
        )
    };
    let more_fragments = packet.ipv4()?.more_fragments();
    check_range(match_offset, match_len, payload_len, more_fragments)?;
    let old_len = packet.total_len();
    packet.splice(payload_start + match_offset, match_len, replacement)?;
    let delta = delta(old_len, packet.total_len());

    let pseudo = packet.pseudo_header()?;
    packet.tcp_mut()?.update_checksum(&pseudo)?;
    stats::mangle("tcp");

    let edit = conn.nat.record_edit(dir, seq, delta);
    debug!(
        "connection {}: TCP {dir} seq {seq} rewrote {match_len} octets at {match_offset} into {}, {edit:?}",
        conn.id(),
        replacement.len()
    );
    Ok(edit)
}

/// Replace `match_len` octets at `match_offset` of the UDP payload of `packet` with
/// `replacement`.
///
/// The UDP length is updated, and the checksum recomputed if the datagram has one.
///
/// # Errors
///
/// As [`mangle_tcp_packet`].
pub fn mangle_udp_packet<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
    match_offset: usize,
    match_len: usize,
    replacement: &[u8],
) -> Result<(), MangleError> {
    let payload_len = packet.udp()?.payload().len();
    let more_fragments = packet.ipv4()?.more_fragments();
    check_range(match_offset, match_len, payload_len, more_fragments)?;
    let payload_start = packet.header_len() + Udp::<&[u8]>::HEADER_LEN;
    packet.splice(payload_start + match_offset, match_len, replacement)?;

    let pseudo = packet.pseudo_header()?;
    let len = packet.l4().len();
    let mut udp = packet.udp_mut()?;
    #[allow(clippy::cast_possible_truncation)] // the datagram is at most 65535 octets
    udp.set_length(len as u16);
    if udp.has_checksum() {
        udp.update_checksum(&pseudo)?;
    }
    stats::mangle("udp");
    debug!(
        "UDP rewrote {match_len} octets at {match_offset} into {}",
        replacement.len()
    );
    Ok(())
}
