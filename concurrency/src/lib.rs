// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

//! Synchronization primitives for the NAT engine.
//!
//! The [`sync`] and [`thread`] modules re-export either the standard library, [loom] or
//! [shuttle], depending on the enabled feature, so that code written against this crate can be
//! model-checked without modification.
//!
//! [`EpochDomain`] provides the quiescence barrier used when removing objects that packet
//! processing may still be looking at.
//!
//! [loom]: https://docs.rs/loom
//! [shuttle]: https://docs.rs/shuttle

#[cfg(all(feature = "loom", feature = "shuttle"))]
compile_error!("Cannot enable both 'loom' and 'shuttle' features at the same time");

#[cfg(not(any(feature = "loom", feature = "shuttle")))]
pub use std::{sync, thread};

#[cfg(feature = "loom")]
pub use loom::{sync, thread};

#[cfg(feature = "shuttle")]
pub use shuttle::{sync, thread};

pub mod epoch;

pub use epoch::{EpochDomain, EpochGuard};
