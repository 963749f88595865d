// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![forbid(unsafe_code)] // Validation logic should always be strictly safe
#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! A library for working with IPv4 packets in the translation path.
//!
//! Packets are held in copy-on-write [`buffer::CowBuffer`]s and accessed through zero-copy header
//! views ([`ipv4::Ipv4`], [`tcp::Tcp`], [`udp::Udp`], [`icmp4::Icmp4`]) which keep checksums
//! consistent when fields are rewritten.

pub mod buffer;
pub mod checksum;
pub mod icmp4;
pub mod ipv4;
pub mod packet;
pub mod route;
pub mod tcp;
pub mod udp;
