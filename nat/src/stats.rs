// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Counters exported through the `metrics` facade.
//!
//! The library only emits; installing a recorder (and an exporter) is up to the application.

use crate::tuple::ManipType;
use metrics::Unit;
use net::packet::DoneReason;

pub const DROPS: &str = "natalg_nat_drops_total";
pub const MANGLES: &str = "natalg_nat_mangles_total";
pub const BINDINGS: &str = "natalg_nat_bindings_total";
pub const EXPECTATIONS: &str = "natalg_nat_expectations_total";
pub const HELPER_TEARDOWNS: &str = "natalg_nat_helper_teardowns_total";

/// Describe the counters to the installed recorder.
pub fn describe() {
    metrics::describe_counter!(DROPS, Unit::Count, "Packets dropped, by reason");
    metrics::describe_counter!(
        MANGLES,
        Unit::Count,
        "Payload rewrites performed by helpers, by transport protocol"
    );
    metrics::describe_counter!(
        BINDINGS,
        Unit::Count,
        "Bindings that changed a connection tuple, by manipulation"
    );
    metrics::describe_counter!(
        EXPECTATIONS,
        Unit::Count,
        "Expectation registrations, by result"
    );
    metrics::describe_counter!(
        HELPER_TEARDOWNS,
        Unit::Count,
        "Connections torn down because their helper was unregistered"
    );
}

pub(crate) fn drop(reason: DoneReason) {
    metrics::counter!(DROPS, "reason" => reason.as_str()).increment(1);
}

pub(crate) fn mangle(proto: &'static str) {
    metrics::counter!(MANGLES, "proto" => proto).increment(1);
}

pub(crate) fn binding(manip: ManipType) {
    metrics::counter!(BINDINGS, "manip" => manip.as_str()).increment(1);
}

pub(crate) fn expectation(result: &'static str) {
    metrics::counter!(EXPECTATIONS, "result" => result).increment(1);
}

pub(crate) fn helper_teardowns(count: u64) {
    metrics::counter!(HELPER_TEARDOWNS).increment(count);
}
