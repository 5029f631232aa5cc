//! Totally-ordered change marker used to decide whether a backup is due.
//!
//! Integers compare numerically and any other text compares lexically, which
//! is the native order of ISO-8601 timestamps. `Epoch` is below everything
//! and stands in for "never backed up".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rendering of the minimum watermark in the state file and reports
pub const EPOCH_TEXT: &str = "1970-01-01 00:00:00";

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Watermark {
    #[default]
    Epoch,
    Numeric(i64),
    Text(String),
}

impl Watermark {
    /// Parse a raw value as returned by the archive database or read back
    /// from the state file. Empty input means no documents, i.e. epoch.
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim();
        if value.is_empty() || value == EPOCH_TEXT {
            return Watermark::Epoch;
        }
        match value.parse::<i64>() {
            Ok(n) => Watermark::Numeric(n),
            Err(_) => Watermark::Text(value.to_string()),
        }
    }

    /// Wall-clock watermark for forced runs, in the same textual shape a
    /// UTC `timestamptz` renders in so both compare lexically.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Watermark::Text(at.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string())
    }

    pub fn is_epoch(&self) -> bool {
        matches!(self, Watermark::Epoch)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Epoch => f.write_str(EPOCH_TEXT),
            Watermark::Numeric(n) => write!(f, "{}", n),
            Watermark::Text(s) => f.write_str(s),
        }
    }
}

impl From<Watermark> for String {
    fn from(value: Watermark) -> Self {
        value.to_string()
    }
}

impl From<String> for Watermark {
    fn from(value: String) -> Self {
        Watermark::parse(&value)
    }
}
