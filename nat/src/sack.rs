// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Removal of the SACK-permitted option.
//!
//! Selective acknowledgment blocks name arbitrary ranges of the sequence space, which a single
//! correction window cannot translate. Connections whose payload may be rewritten negotiate
//! without SACK: the option is replaced by no-ops in their initial SYN.

use net::buffer::PacketBufferMut;
use net::packet::{Packet, PacketError};
use net::tcp::option_kind;
use tracing::debug;

/// Overwrite every SACK-permitted option of a TCP segment with two no-op options.
///
/// The segment length does not change and the checksum is updated incrementally. The buffer is
/// only made exclusive if an option was found. Returns true if the segment was modified.
///
/// # Errors
///
/// Fails if the packet is not a valid TCP segment or its buffer cannot be made exclusive.
pub fn strip_sack_permitted<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
) -> Result<bool, PacketError> {
    let offsets: Vec<usize> = packet
        .tcp()?
        .options()
        .filter(|o| {
            o.kind == option_kind::SACK_PERMITTED
                && o.len == usize::from(option_kind::SACK_PERMITTED_LEN)
        })
        .map(|o| o.offset)
        .collect();
    if offsets.is_empty() {
        return Ok(false);
    }
    let mut tcp = packet.tcp_mut()?;
    for offset in offsets {
        tcp.overwrite(offset, &[option_kind::NOP, option_kind::NOP]);
    }
    debug!("stripped SACK-permitted from SYN");
    Ok(true)
}
