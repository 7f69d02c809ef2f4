//! Log line model
//!
//! A [`LogLine`] is one line of CI output: a timestamp and a text payload.
//! On the append wire format a line is a two-element JSON array,
//! `[epoch_seconds, text]`, where the timestamp may carry fractional
//! seconds. Internally timestamps are `chrono::DateTime<Utc>` with
//! millisecond precision.
//!
//! [`LogLineItem`] is the read-side shape: the same data plus a provenance
//! flag telling the presentation layer whether the line came from the
//! build's global log or from the test's own log.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single timestamped line of log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// When the line was produced.
    pub time: DateTime<Utc>,

    /// The text payload, without a trailing newline.
    pub data: String,
}

impl LogLine {
    pub fn new(time: DateTime<Utc>, data: impl Into<String>) -> Self {
        Self {
            time,
            data: data.into(),
        }
    }

    /// Construct a line from a fractional epoch-seconds timestamp, the
    /// shape used on the wire.
    pub fn from_epoch_seconds(seconds: f64, data: impl Into<String>) -> Option<Self> {
        let millis = (seconds * 1000.0).round() as i64;
        let time = Utc.timestamp_millis_opt(millis).single()?;
        Some(Self::new(time, data))
    }

    /// Serialized size of this line, the quantity the chunking engine
    /// accumulates against the chunk size bound.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    fn epoch_seconds(&self) -> f64 {
        self.time.timestamp_millis() as f64 / 1000.0
    }
}

impl Serialize for LogLine {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.epoch_seconds())?;
        seq.serialize_element(&self.data)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for LogLine {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LineVisitor;

        impl<'de> Visitor<'de> for LineVisitor {
            type Value = LogLine;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [timestamp, text] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<LogLine, A::Error> {
                let seconds: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let data: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                // Drain anything past the pair so malformed-but-longer
                // arrays fail cleanly instead of poisoning the outer seq.
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}

                LogLine::from_epoch_seconds(seconds, data)
                    .ok_or_else(|| de::Error::custom("timestamp out of range"))
            }
        }

        deserializer.deserialize_seq(LineVisitor)
    }
}

/// A line in a merged view, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLineItem {
    pub time: DateTime<Utc>,
    pub data: String,

    /// True when the line belongs to the build's global log rather than to
    /// the test whose view it appears in.
    pub global: bool,
}

impl LogLineItem {
    pub fn from_line(line: LogLine, global: bool) -> Self {
        Self {
            time: line.time,
            data: line.data,
            global,
        }
    }
}
