//! Access tokens with a known lifetime
//!
//! A `TemporalToken` pairs a credential with the instant it was issued and
//! the unit its `expires_in` count is expressed in. The absolute expiry is
//! computed once at construction; tokens are replaced, never mutated.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use token_service::Credential;

use crate::error::{Error, Result};

/// Granularity of a credential's `expires_in` count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlUnit {
    Nanos,
    Micros,
    Millis,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TtlUnit {
    /// `count` units as a duration, or `None` if it does not fit.
    pub fn duration_of(self, count: u64) -> Option<Duration> {
        match self {
            TtlUnit::Nanos => Some(Duration::from_nanos(count)),
            TtlUnit::Micros => Some(Duration::from_micros(count)),
            TtlUnit::Millis => Some(Duration::from_millis(count)),
            TtlUnit::Seconds => Some(Duration::from_secs(count)),
            TtlUnit::Minutes => count.checked_mul(60).map(Duration::from_secs),
            TtlUnit::Hours => count.checked_mul(3_600).map(Duration::from_secs),
            TtlUnit::Days => count.checked_mul(86_400).map(Duration::from_secs),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TtlUnit::Nanos => "nanos",
            TtlUnit::Micros => "micros",
            TtlUnit::Millis => "millis",
            TtlUnit::Seconds => "seconds",
            TtlUnit::Minutes => "minutes",
            TtlUnit::Hours => "hours",
            TtlUnit::Days => "days",
        }
    }
}

impl fmt::Display for TtlUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TtlUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nanos" => Ok(TtlUnit::Nanos),
            "micros" => Ok(TtlUnit::Micros),
            "millis" => Ok(TtlUnit::Millis),
            "seconds" => Ok(TtlUnit::Seconds),
            "minutes" => Ok(TtlUnit::Minutes),
            "hours" => Ok(TtlUnit::Hours),
            "days" => Ok(TtlUnit::Days),
            other => Err(Error::UnsupportedUnit(other.to_string())),
        }
    }
}

/// A credential together with its issue instant and lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalToken {
    credential: Credential,
    issued_at: SystemTime,
    ttl_unit: TtlUnit,
    ttl: Duration,
    expires_at: SystemTime,
}

impl TemporalToken {
    /// Wrap `credential`, interpreting `expires_in` in `ttl_unit`.
    ///
    /// Fails with `InvalidArgument` for a negative `expires_in` or a lifetime
    /// that cannot be represented.
    pub fn new(credential: Credential, issued_at: SystemTime, ttl_unit: TtlUnit) -> Result<Self> {
        let count = u64::try_from(credential.expires_in).map_err(|_| {
            Error::InvalidArgument(format!(
                "expires_in must not be negative: {}",
                credential.expires_in
            ))
        })?;
        let ttl = ttl_unit.duration_of(count).ok_or_else(|| {
            Error::InvalidArgument(format!("expires_in {count} {ttl_unit} overflows"))
        })?;
        let expires_at = issued_at.checked_add(ttl).ok_or_else(|| {
            Error::InvalidArgument(format!("expires_in {count} {ttl_unit} overflows"))
        })?;

        Ok(Self {
            credential,
            issued_at,
            ttl_unit,
            ttl,
            expires_at,
        })
    }

    /// Wrap `credential` with `expires_in` in seconds.
    pub fn with_default_unit(credential: Credential, issued_at: SystemTime) -> Result<Self> {
        Self::new(credential, issued_at, TtlUnit::Seconds)
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn ttl_unit(&self) -> TtlUnit {
        self.ttl_unit
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Time remaining until expiry, zero once expired.
    pub fn ttl_left(&self) -> Duration {
        self.ttl_left_at(SystemTime::now())
    }

    pub fn ttl_left_at(&self, now: SystemTime) -> Duration {
        self.expires_at.duration_since(now).unwrap_or(Duration::ZERO)
    }

    /// Time remaining, floored to whole `unit`s.
    ///
    /// Microseconds are a valid lifetime granularity but are not reported here.
    pub fn ttl_left_in(&self, unit: TtlUnit) -> Result<u64> {
        let left = self.ttl_left();
        let secs = left.as_secs();
        match unit {
            TtlUnit::Nanos => Ok(u64::try_from(left.as_nanos()).unwrap_or(u64::MAX)),
            TtlUnit::Millis => Ok(u64::try_from(left.as_millis()).unwrap_or(u64::MAX)),
            TtlUnit::Seconds => Ok(secs),
            TtlUnit::Minutes => Ok(secs / 60),
            TtlUnit::Hours => Ok(secs / 3_600),
            TtlUnit::Days => Ok(secs / 86_400),
            TtlUnit::Micros => Err(Error::UnsupportedUnit(unit.to_string())),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let token =
            TemporalToken::with_default_unit(Credential::new("at", 600), at(1_000)).unwrap();

        assert!(!token.is_expired_at(at(1_599)));
        assert!(!token.is_expired_at(at(1_600) - Duration::from_nanos(1)));
        assert!(token.is_expired_at(at(1_600)));
        assert!(token.is_expired_at(at(5_000)));
        assert_eq!(token.expires_at(), at(1_600));
    }

    #[test]
    fn ttl_is_scaled_by_unit() {
        let token =
            TemporalToken::new(Credential::new("at", 90), at(0), TtlUnit::Minutes).unwrap();
        assert_eq!(token.ttl(), Duration::from_secs(5_400));
        assert_eq!(token.ttl_unit(), TtlUnit::Minutes);

        let token = TemporalToken::new(Credential::new("at", 1_500), at(0), TtlUnit::Millis).unwrap();
        assert_eq!(token.ttl(), Duration::from_millis(1_500));
    }

    #[test]
    fn ttl_left_never_goes_negative() {
        let token = TemporalToken::with_default_unit(Credential::new("at", 60), at(100)).unwrap();
        assert_eq!(token.ttl_left_at(at(130)), Duration::from_secs(30));
        assert_eq!(token.ttl_left_at(at(160)), Duration::ZERO);
        assert_eq!(token.ttl_left_at(at(1_000)), Duration::ZERO);
    }

    #[test]
    fn zero_ttl_is_immediately_expired() {
        let token = TemporalToken::with_default_unit(Credential::new("at", 0), at(100)).unwrap();
        assert!(token.is_expired_at(at(100)));
        assert!(token.is_expired());
    }

    #[test]
    fn negative_expires_in_is_rejected() {
        let err = TemporalToken::with_default_unit(Credential::new("at", -1), at(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "got: {err:?}");
    }

    #[test]
    fn overflowing_ttl_is_rejected() {
        let err =
            TemporalToken::new(Credential::new("at", i64::MAX), at(0), TtlUnit::Days).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "got: {err:?}");
    }

    #[test]
    fn ttl_left_in_floors_to_unit() {
        let token = TemporalToken::new(
            Credential::new("at", 3),
            SystemTime::now(),
            TtlUnit::Hours,
        )
        .unwrap();

        // A few microseconds may elapse between issuing and reading.
        assert_eq!(token.ttl_left_in(TtlUnit::Hours).unwrap(), 2);
        assert_eq!(token.ttl_left_in(TtlUnit::Minutes).unwrap(), 179);
        assert_eq!(token.ttl_left_in(TtlUnit::Days).unwrap(), 0);
        let secs = token.ttl_left_in(TtlUnit::Seconds).unwrap();
        assert!((10_790..10_800).contains(&secs), "got: {secs}");
        assert!(token.ttl_left_in(TtlUnit::Millis).unwrap() > 10_790_000);
        assert!(token.ttl_left_in(TtlUnit::Nanos).unwrap() > 10_790_000_000_000);
    }

    #[test]
    fn ttl_left_in_micros_is_unsupported() {
        let token = TemporalToken::with_default_unit(Credential::new("at", 60), SystemTime::now())
            .unwrap();
        let err = token.ttl_left_in(TtlUnit::Micros).unwrap_err();
        assert!(matches!(err, Error::UnsupportedUnit(_)), "got: {err:?}");
    }

    #[test]
    fn ttl_unit_parses_and_deserializes() {
        assert_eq!("millis".parse::<TtlUnit>().unwrap(), TtlUnit::Millis);
        assert_eq!("days".parse::<TtlUnit>().unwrap(), TtlUnit::Days);
        assert!(matches!(
            "fortnights".parse::<TtlUnit>(),
            Err(Error::UnsupportedUnit(_))
        ));

        let unit: TtlUnit = serde_json::from_str(r#""minutes""#).unwrap();
        assert_eq!(unit, TtlUnit::Minutes);
        assert_eq!(TtlUnit::default(), TtlUnit::Seconds);
    }

    #[test]
    fn duration_of_reports_overflow() {
        assert_eq!(TtlUnit::Days.duration_of(2), Some(Duration::from_secs(172_800)));
        assert_eq!(TtlUnit::Micros.duration_of(5), Some(Duration::from_micros(5)));
        assert_eq!(TtlUnit::Days.duration_of(u64::MAX), None);
    }
}
