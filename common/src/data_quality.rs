//! Sanity checks for `video_sent` records before they reach the assembler.
//!
//! Only values that cannot enter a feature row are rejected; zero or odd but
//! finite statistics are kept as reported.

use std::fmt;

use crate::telemetry::SentRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordRejection {
    /// A field is NaN or infinite
    NonFinite(&'static str),
}

impl fmt::Display for RecordRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRejection::NonFinite(field) => write!(f, "non-finite {}", field),
        }
    }
}

impl std::error::Error for RecordRejection {}

pub fn validate_sent(record: &SentRecord) -> Result<(), RecordRejection> {
    let fields = [
        ("size", record.size),
        ("delivery_rate", record.delivery_rate),
        ("cwnd", record.cwnd),
        ("in_flight", record.in_flight),
        ("min_rtt", record.min_rtt),
        ("rtt", record.rtt),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(RecordRejection::NonFinite(name));
        }
    }
    Ok(())
}
