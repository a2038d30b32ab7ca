//! Link configuration.
//!
//! All options can be set by name with [`LinkConfig::set_option`], using the
//! option names of the configuration surface: `expansionUnitCount`,
//! `linkTimeout`, `gapAdjustment`, `pollTimeout`, `responseTimeout`,
//! `retryLimit`, `faultLimit`, `keepaliveInterval` and `role`. Times are
//! given in milliseconds, `gapAdjustment` in units of 0.1 ms.
//!
//! ```
//! use lcp_proto::config::{LinkConfig, Role};
//! let config = LinkConfig::from_options("role=station expansionUnitCount=2 pollTimeout=5000")?;
//! assert_eq!(config.role, Role::Station);
//! assert_eq!(*config.expansion_units, 2);
//! # Ok::<(), lcp_proto::config::Error>(())
//! ```

use std::time::Duration;

use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::types::{self, ExpansionUnits};

/// Delay between power up and the first Recall of a controller.
pub const POWER_UP_DELAY: Duration = Duration::from_secs(5);

/// Error type for configuration parsing and validation.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Unknown option {name:?}"))]
    UnknownOption { name: String },
    #[snafu(display("Option {option:?} is not of the form name=value"))]
    MalformedOption { option: String },
    #[snafu(display("Invalid value {value:?} for option {name}"))]
    InvalidNumber {
        name: &'static str,
        value: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("Invalid expansion unit count"))]
    Units { source: types::Error },
    #[snafu(display("Invalid role {value:?}, expected controller or station"))]
    InvalidRole { value: String },
    #[snafu(display("{name} must be non-zero"))]
    ZeroTimeout { name: &'static str },
    #[snafu(display("keepaliveInterval must be shorter than pollTimeout"))]
    KeepaliveTooLong,
}

/// Which end of the link this is.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// Issues controls, recalls indications [`POWER_UP_DELAY`] after power up.
    Controller,
    /// Field side, recalls controls after a line break clears or a
    /// transmission failure.
    Station,
}

/// Per-session link parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub role: Role,
    /// Fixes the bit vector length for the session.
    pub expansion_units: ExpansionUnits,
    /// Longest gap allowed between the bytes of one frame.
    pub link_timeout: Duration,
    /// Extra inter-byte slack in units of 0.1 ms.
    pub gap_adjustment: u16,
    /// Longest silence before the link is declared failed.
    pub poll_timeout: Duration,
    /// How long to wait for the `All` answering a Recall.
    pub response_timeout: Duration,
    /// Recalls repeated after a response timeout before giving up.
    pub retry_limit: u32,
    /// Consecutive frame or transport faults that fail the link, if set.
    pub fault_limit: Option<u32>,
    /// Quiet time after which an active link repeats the health bit.
    pub keepalive_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            role: Role::Controller,
            expansion_units: ExpansionUnits::default(),
            link_timeout: Duration::from_millis(200),
            gap_adjustment: 0,
            poll_timeout: Duration::from_millis(3000),
            response_timeout: Duration::from_millis(1000),
            retry_limit: 3,
            fault_limit: None,
            keepalive_interval: Duration::from_millis(1000),
        }
    }
}

impl LinkConfig {
    /// Parse a whitespace separated list of `name=value` options on top of
    /// the defaults.
    /// # Errors
    /// Returns the first malformed or unknown option, or a validation error.
    pub fn from_options(options: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        for option in options.split_whitespace() {
            let (name, value) = option
                .split_once('=')
                .with_context(|| MalformedOptionSnafu { option })?;
            config.set_option(name, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set a single option by name.
    /// # Errors
    /// Returns [`Error::UnknownOption`] for unrecognised names, or a parse error.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "role" => {
                self.role = match value.to_ascii_lowercase().as_str() {
                    "controller" => Role::Controller,
                    "station" => Role::Station,
                    _ => return InvalidRoleSnafu { value }.fail(),
                }
            }
            "expansionUnitCount" => {
                let count: u8 = parse_number("expansionUnitCount", value)?;
                self.expansion_units = ExpansionUnits::new(count).context(UnitsSnafu)?;
            }
            "linkTimeout" => self.link_timeout = millis("linkTimeout", value)?,
            "gapAdjustment" => self.gap_adjustment = parse_number("gapAdjustment", value)?,
            "pollTimeout" => self.poll_timeout = millis("pollTimeout", value)?,
            "responseTimeout" => self.response_timeout = millis("responseTimeout", value)?,
            "retryLimit" => self.retry_limit = parse_number("retryLimit", value)?,
            "keepaliveInterval" => self.keepalive_interval = millis("keepaliveInterval", value)?,
            "faultLimit" => {
                let limit: u32 = parse_number("faultLimit", value)?;
                self.fault_limit = if limit == 0 { None } else { Some(limit) };
            }
            _ => return UnknownOptionSnafu { name }.fail(),
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`Error::ZeroTimeout`] if any timeout is zero, or
    /// [`Error::KeepaliveTooLong`] if the peer would time out between
    /// keepalives.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, timeout) in [
            ("linkTimeout", self.link_timeout),
            ("pollTimeout", self.poll_timeout),
            ("responseTimeout", self.response_timeout),
            ("keepaliveInterval", self.keepalive_interval),
        ] {
            ensure!(!timeout.is_zero(), ZeroTimeoutSnafu { name });
        }
        ensure!(
            self.keepalive_interval < self.poll_timeout,
            KeepaliveTooLongSnafu
        );
        Ok(())
    }

    /// Longest gap between two bytes of the same frame.
    pub fn inter_byte_gap(&self) -> Duration {
        self.link_timeout + Duration::from_micros(100 * u64::from(self.gap_adjustment))
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_expansion_units(mut self, units: ExpansionUnits) -> Self {
        self.expansion_units = units;
        self
    }

    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_fault_limit(mut self, limit: Option<u32>) -> Self {
        self.fault_limit = limit;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

fn parse_number<T>(name: &'static str, value: &str) -> Result<T, Error>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    value.parse().context(InvalidNumberSnafu { name, value })
}

fn millis(name: &'static str, value: &str) -> Result<Duration, Error> {
    parse_number(name, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::units;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.inter_byte_gap(), Duration::from_millis(200));
    }

    #[test]
    fn test_all_options() {
        let config = LinkConfig::from_options(
            "role=Station expansionUnitCount=6 linkTimeout=50 gapAdjustment=32 \
             pollTimeout=4000 responseTimeout=700 retryLimit=5 faultLimit=10 \
             keepaliveInterval=1500",
        )
        .unwrap();
        assert_eq!(
            config,
            LinkConfig {
                role: Role::Station,
                expansion_units: units(6),
                link_timeout: Duration::from_millis(50),
                gap_adjustment: 32,
                poll_timeout: Duration::from_millis(4000),
                response_timeout: Duration::from_millis(700),
                retry_limit: 5,
                fault_limit: Some(10),
                keepalive_interval: Duration::from_millis(1500),
            }
        );
        assert_eq!(config.inter_byte_gap(), Duration::from_micros(53_200));
    }

    #[test]
    fn test_option_errors() {
        assert!(matches!(
            LinkConfig::from_options("baud=9600"),
            Err(Error::UnknownOption { .. })
        ));
        assert!(matches!(
            LinkConfig::from_options("pollTimeout"),
            Err(Error::MalformedOption { .. })
        ));
        assert!(matches!(
            LinkConfig::from_options("retryLimit=-1"),
            Err(Error::InvalidNumber { .. })
        ));
        assert!(matches!(
            LinkConfig::from_options("expansionUnitCount=7"),
            Err(Error::Units { .. })
        ));
        assert!(matches!(
            LinkConfig::from_options("role=master"),
            Err(Error::InvalidRole { .. })
        ));
        assert_eq!(
            LinkConfig::from_options("pollTimeout=1000"),
            Err(Error::KeepaliveTooLong)
        );
        assert_eq!(
            LinkConfig::from_options("responseTimeout=0"),
            Err(Error::ZeroTimeout {
                name: "responseTimeout"
            })
        );
    }
}
