// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configuration of the NAT engine.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

const DEFAULT_EXPECT_PORT_RANGE: u16 = 64;
const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_LOG_BURST: u32 = 10;
const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Tunables of a [`crate::NatEngine`]. N.B. we derive a builder type `NatConfigBuilder` with a
/// default for each field.
#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatConfig {
    /// Number of destination ports tried when registering an expectation
    #[builder(default = DEFAULT_EXPECT_PORT_RANGE)]
    pub expect_port_range: u16,

    /// Lifetime of an expectation nothing matched (seconds in YAML)
    #[builder(default = DEFAULT_EXPECT_TIMEOUT)]
    #[serde(rename = "expect_timeout_secs", with = "serde_duration")]
    pub expect_timeout: Duration,

    /// Remove SACK-permitted from the SYN of connections handled by a helper
    #[builder(default = true)]
    pub strip_sack: bool,

    /// Drop warnings logged per interval
    #[builder(default = DEFAULT_LOG_BURST)]
    pub log_burst: u32,

    /// Rate-limiting interval of drop warnings (milliseconds in YAML)
    #[builder(default = DEFAULT_LOG_INTERVAL)]
    #[serde(rename = "log_interval_ms", with = "serde_millis")]
    pub log_interval: Duration,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            expect_port_range: DEFAULT_EXPECT_PORT_RANGE,
            expect_timeout: DEFAULT_EXPECT_TIMEOUT,
            strip_sack: true,
            log_burst: DEFAULT_LOG_BURST,
            log_interval: DEFAULT_LOG_INTERVAL,
        }
    }
}

impl NatConfig {
    #[must_use]
    pub fn builder() -> NatConfigBuilder {
        NatConfigBuilder::default()
    }

    /// Parse and validate a YAML document. Missing fields take their default value.
    ///
    /// # Errors
    ///
    /// Fails if the document does not parse or the configuration is invalid.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: NatConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a value cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expect_port_range == 0 {
            return Err(ConfigError::Invalid("expect_port_range must not be zero"));
        }
        if self.log_burst == 0 {
            return Err(ConfigError::Invalid("log_burst must not be zero"));
        }
        Ok(())
    }
}

impl Display for NatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        writeln!(f, "NAT config")?;
        writeln!(f, "  expect port range: {}", self.expect_port_range)?;
        writeln!(f, "  expect timeout   : {:?}", self.expect_timeout)?;
        writeln!(f, "  strip SACK       : {}", self.strip_sack)?;
        writeln!(
            f,
            "  drop log limit   : {} per {:?}",
            self.log_burst, self.log_interval
        )
    }
}
