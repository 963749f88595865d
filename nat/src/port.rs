// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NAT port: the transport part of a binding.

use etherparse::IpNumber;
use std::num::NonZero;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum NatPortError {
    #[error("invalid port ({0})")]
    InvalidPort(u16),
}

/// `NatPort` is the transport value a binding maps an endpoint to: a non-zero TCP or UDP port,
/// or an `ICMPv4` echo identifier (for which zero is valid).
#[cfg_attr(test, derive(bolero::TypeGenerator))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatPort {
    Port(NonZero<u16>),
    Identifier(u16),
}

impl NatPort {
    #[must_use]
    pub fn new_port(port: NonZero<u16>) -> NatPort {
        NatPort::Port(port)
    }

    /// # Errors
    ///
    /// Returns [`NatPortError::InvalidPort`] for port zero.
    pub fn new_port_checked(port: u16) -> Result<NatPort, NatPortError> {
        NonZero::new(port).map_or(Err(NatPortError::InvalidPort(port)), |port| {
            Ok(NatPort::Port(port))
        })
    }

    #[must_use]
    pub fn new_identifier(id: u16) -> NatPort {
        NatPort::Identifier(id)
    }

    /// Build the value appropriate for `proto`: an identifier for `ICMPv4`, a port otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`NatPortError::InvalidPort`] for port zero with TCP or UDP.
    pub fn for_protocol(proto: IpNumber, value: u16) -> Result<NatPort, NatPortError> {
        if proto == IpNumber::ICMP {
            Ok(NatPort::Identifier(value))
        } else {
            NatPort::new_port_checked(value)
        }
    }

    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            NatPort::Port(port) => port.into(),
            NatPort::Identifier(id) => id,
        }
    }
}

impl TryFrom<NatPort> for NonZero<u16> {
    type Error = NatPortError;

    fn try_from(port: NatPort) -> Result<Self, Self::Error> {
        port.as_u16()
            .try_into()
            .map_err(|_| NatPortError::InvalidPort(port.as_u16()))
    }
}
