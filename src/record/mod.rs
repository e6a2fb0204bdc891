//! TDDF record model and classification.
//!
//! A raw fixed-width line becomes exactly one [`ClassifiedRecord`]; lines that
//! cannot be decoded are kept as `SKIPPED` records with a reason rather than
//! dropped.

mod classifier;
pub mod schema;

pub use classifier::{classify, classify_all};

#[cfg(test)]
pub(crate) use classifier::tests as fixtures;

use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// A line as read from a TDDF file. Immutable once read.
///
/// Content is kept as bytes: field positions are byte offsets, and a byte
/// that is not valid UTF-8 must not move the fields after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub file_id: String,
    /// 1-based position in the file.
    pub line_number: u64,
    pub content: Bytes,
    pub business_day: NaiveDate,
}

impl RawLine {
    /// The line as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Record type, keyed by the two-character record identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum RecordType {
    BH,
    DT,
    P1,
    P2,
    E1,
    G2,
    AD,
    DR,
    CK,
    LG,
    GE,
    #[serde(rename = "OTHER")]
    Other,
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl RecordType {
    /// Types with a schema in the layout table.
    pub const KNOWN: [RecordType; 11] = [
        RecordType::BH,
        RecordType::DT,
        RecordType::P1,
        RecordType::P2,
        RecordType::E1,
        RecordType::G2,
        RecordType::AD,
        RecordType::DR,
        RecordType::CK,
        RecordType::LG,
        RecordType::GE,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::BH => "BH",
            RecordType::DT => "DT",
            RecordType::P1 => "P1",
            RecordType::P2 => "P2",
            RecordType::E1 => "E1",
            RecordType::G2 => "G2",
            RecordType::AD => "AD",
            RecordType::DR => "DR",
            RecordType::CK => "CK",
            RecordType::LG => "LG",
            RecordType::GE => "GE",
            RecordType::Other => "OTHER",
            RecordType::Skipped => "SKIPPED",
        }
    }

    /// Resolve a record identifier to a known type.
    pub fn from_identifier(identifier: &str) -> Option<RecordType> {
        RecordType::KNOWN
            .into_iter()
            .find(|t| t.as_str() == identifier)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-point money amount in integer cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(i64);

impl Amount {
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(i64),
    Amount(Amount),
    Date(NaiveDate),
}

/// A named field decoded from its schema position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordField {
    pub name: &'static str,
    pub value: FieldValue,
}

/// Why a line was classified as `SKIPPED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipReason {
    /// Type named by the record identifier, when it was a known one.
    pub detected: Option<RecordType>,
    pub reason: String,
}

/// The typed interpretation of one raw line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedRecord {
    /// `"{file_id}:{line_number}"`; stable across reprocessing.
    pub record_id: String,
    pub file_id: String,
    pub line_number: u64,
    pub business_day: NaiveDate,
    pub record_type: RecordType,
    /// Decoded fields keyed by their 1-based start position.
    pub fields: BTreeMap<usize, RecordField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_amount: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipReason>,
}

impl ClassifiedRecord {
    pub fn record_id(file_id: &str, line_number: u64) -> String {
        format!("{file_id}:{line_number}")
    }

    /// Look up a decoded field by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .values()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    pub fn is_skipped(&self) -> bool {
        self.record_type == RecordType::Skipped
    }
}

/// Per-type tallies of classified records.
///
/// `total_lines` always equals the sum of `processed` plus all skipped counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounts {
    /// Non-skipped records per type, including `OTHER`.
    pub processed: BTreeMap<RecordType, u64>,
    /// Skipped records whose identifier named a known type.
    pub skipped: BTreeMap<RecordType, u64>,
    /// Skipped records with no usable identifier.
    pub skipped_unrecognized: u64,
    pub total_lines: u64,
}

impl RecordCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a ClassifiedRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            counts.add(record);
        }
        counts
    }

    pub fn add(&mut self, record: &ClassifiedRecord) {
        self.total_lines += 1;
        match (&record.record_type, &record.skip) {
            (RecordType::Skipped, Some(SkipReason { detected: Some(t), .. })) => {
                *self.skipped.entry(*t).or_default() += 1;
            }
            (RecordType::Skipped, _) => self.skipped_unrecognized += 1,
            (t, _) => *self.processed.entry(*t).or_default() += 1,
        }
    }

    pub fn merge(&mut self, other: &RecordCounts) {
        for (t, n) in &other.processed {
            *self.processed.entry(*t).or_default() += n;
        }
        for (t, n) in &other.skipped {
            *self.skipped.entry(*t).or_default() += n;
        }
        self.skipped_unrecognized += other.skipped_unrecognized;
        self.total_lines += other.total_lines;
    }

    /// Remove counts previously merged in, e.g. when a file is reprocessed.
    pub fn subtract(&mut self, other: &RecordCounts) {
        for (t, n) in &other.processed {
            let entry = self.processed.entry(*t).or_default();
            *entry = entry.saturating_sub(*n);
        }
        for (t, n) in &other.skipped {
            let entry = self.skipped.entry(*t).or_default();
            *entry = entry.saturating_sub(*n);
        }
        self.skipped_unrecognized = self
            .skipped_unrecognized
            .saturating_sub(other.skipped_unrecognized);
        self.total_lines = self.total_lines.saturating_sub(other.total_lines);
    }

    pub fn processed_of(&self, record_type: RecordType) -> u64 {
        self.processed.get(&record_type).copied().unwrap_or(0)
    }

    pub fn skipped_of(&self, record_type: RecordType) -> u64 {
        self.skipped.get(&record_type).copied().unwrap_or(0)
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.values().sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped.values().sum::<u64>() + self.skipped_unrecognized
    }
}
