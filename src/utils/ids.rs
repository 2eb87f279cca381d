// src/utils/ids.rs
use chrono::{DateTime, TimeZone, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdType {
    Dispatch,
    Ride,
    Driver,
    Rider,
}

impl IdType {
    pub fn to_prefix(&self) -> &'static str {
        match self {
            IdType::Dispatch => "dsp",
            IdType::Ride => "rid",
            IdType::Driver => "drv",
            IdType::Rider => "usr",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_prefix())
    }
}

/// Length of the random tail in every id.
const TAIL_LEN: usize = 6;

/// Ids look like `dsp-260314-k3v9qa`: type prefix, creation date, random
/// alphanumeric tail. The embedded date lets support staff read the creation
/// day straight off an id and keeps ids roughly sortable per day.
pub struct IdGenerator;

impl IdGenerator {
    pub fn generate(id_type: IdType) -> String {
        Self::generate_with_timestamp(id_type, Utc::now())
    }

    /// Timestamp-injected variant so tests can pin the date part.
    pub fn generate_with_timestamp(id_type: IdType, timestamp: DateTime<Utc>) -> String {
        let tail: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TAIL_LEN)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect();
        format!("{}-{}-{}", id_type.to_prefix(), timestamp.format("%y%m%d"), tail)
    }

    /// Split an id back into its components.
    pub fn parse_id(id: &str) -> Result<ParsedId, IdError> {
        let mut parts = id.split('-');
        let (Some(prefix), Some(date_part), Some(tail), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(IdError::InvalidFormat);
        };

        if date_part.len() != 6 || tail.len() != TAIL_LEN {
            return Err(IdError::InvalidFormat);
        }
        if !tail.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IdError::InvalidFormat);
        }

        let id_type = match prefix {
            "dsp" => IdType::Dispatch,
            "rid" => IdType::Ride,
            "drv" => IdType::Driver,
            "usr" => IdType::Rider,
            other => return Err(IdError::UnknownType(other.to_string())),
        };

        // Two digits each of year, month, day.
        let year = 2000
            + date_part[0..2]
                .parse::<i32>()
                .map_err(|_| IdError::InvalidDate)?;
        let month = date_part[2..4].parse::<u32>().map_err(|_| IdError::InvalidDate)?;
        let day = date_part[4..6].parse::<u32>().map_err(|_| IdError::InvalidDate)?;

        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(IdError::InvalidDate);
        }

        Ok(ParsedId {
            id_type,
            year,
            month,
            day,
            tail: tail.to_string(),
        })
    }

    /// True when the id parses and, if given, matches the expected type.
    pub fn validate_id(id: &str, expected_type: Option<IdType>) -> bool {
        match Self::parse_id(id) {
            Ok(parsed) => match expected_type {
                Some(expected) => parsed.id_type == expected,
                None => true,
            },
            Err(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid ID format")]
    InvalidFormat,

    #[error("Unknown ID type: {0}")]
    UnknownType(String),

    #[error("Invalid date component in ID")]
    InvalidDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedId {
    pub id_type: IdType,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub tail: String,
}

impl ParsedId {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(self.year, self.month, self.day, 0, 0, 0)
            .single()
    }
}

/// Mint a 6-digit numeric OTP. Leading zeros are allowed.
pub fn generate_otp() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:06}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_date_and_tail() {
        let id = IdGenerator::generate(IdType::Dispatch);
        assert!(id.starts_with("dsp-"));

        let parsed = IdGenerator::parse_id(&id).unwrap();
        assert_eq!(parsed.id_type, IdType::Dispatch);
        assert_eq!(parsed.tail.len(), TAIL_LEN);
        assert!(parsed.tail.chars().all(|c| c.is_ascii_alphanumeric()));

        assert!(IdGenerator::generate(IdType::Ride).starts_with("rid-"));
    }

    #[test]
    fn parse_recovers_the_creation_date() {
        let stamped = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap();
        let id = IdGenerator::generate_with_timestamp(IdType::Driver, stamped);

        let parsed = IdGenerator::parse_id(&id).unwrap();
        assert_eq!(parsed.year, 2026);
        assert_eq!(parsed.month, 3);
        assert_eq!(parsed.day, 14);
        assert_eq!(
            parsed.to_datetime().unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn validation_checks_format_and_type() {
        let ride_id = IdGenerator::generate(IdType::Ride);
        assert!(IdGenerator::validate_id(&ride_id, Some(IdType::Ride)));
        assert!(IdGenerator::validate_id(&ride_id, None));
        assert!(!IdGenerator::validate_id(&ride_id, Some(IdType::Dispatch)));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert_eq!(IdGenerator::parse_id("abc").unwrap_err(), IdError::InvalidFormat);
        assert_eq!(
            IdGenerator::parse_id("dsp-260314-tooLongTail").unwrap_err(),
            IdError::InvalidFormat
        );
        assert_eq!(
            IdGenerator::parse_id("dsp-260314-a1b_c9").unwrap_err(),
            IdError::InvalidFormat
        );
        assert_eq!(
            IdGenerator::parse_id("xyz-260314-a1b2c9").unwrap_err(),
            IdError::UnknownType("xyz".to_string())
        );
        assert_eq!(
            IdGenerator::parse_id("dsp-261514-a1b2c9").unwrap_err(),
            IdError::InvalidDate
        );
        assert!(!IdGenerator::validate_id("dsp-260314-a1b2c9-extra", None));
    }

    #[test]
    fn otp_is_six_digits() {
        for _ in 0..50 {
            let otp = generate_otp();
            assert_eq!(otp.len(), 6);
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
