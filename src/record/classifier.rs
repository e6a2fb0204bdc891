//! Raw line to typed record.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use super::schema::{
    self, FieldKind, FieldSpec, HEADER, IDENTIFIER, MERCHANT_ACCOUNT, TRACE_NUMBER,
    TRANSACTION_AMOUNT, TRANSACTION_DATE,
};
use super::{Amount, ClassifiedRecord, FieldValue, RawLine, RecordField, RecordType, SkipReason};

const DATE_FORMAT: &str = "%m%d%Y";

/// Classify one raw line. Never fails: undecodable lines come back as
/// `SKIPPED` with a reason.
pub fn classify(line: &RawLine) -> ClassifiedRecord {
    let content: &[u8] = &line.content;
    let mut record = ClassifiedRecord {
        record_id: ClassifiedRecord::record_id(&line.file_id, line.line_number),
        file_id: line.file_id.clone(),
        line_number: line.line_number,
        business_day: line.business_day,
        record_type: RecordType::Skipped,
        fields: BTreeMap::new(),
        merchant_account_number: None,
        transaction_date: None,
        transaction_amount: None,
        trace_number: None,
        skip: None,
    };

    if content.trim_ascii().is_empty() {
        return skipped(record, None, "empty line".to_string());
    }

    let Some(identifier) = content.get(IDENTIFIER.range()) else {
        return skipped(
            record,
            None,
            format!(
                "line length {} is shorter than the record identifier",
                content.len()
            ),
        );
    };

    // Header fields are informational; a bad header value never skips a line.
    for spec in HEADER {
        if let Ok(Some(value)) = decode(content, spec) {
            record.fields.insert(
                spec.start,
                RecordField {
                    name: spec.name,
                    value,
                },
            );
        }
    }

    let identifier = std::str::from_utf8(identifier).ok();
    let Some(record_type) = identifier.and_then(RecordType::from_identifier) else {
        record.record_type = RecordType::Other;
        return record;
    };
    let Some(schema) = schema::schema_for(record_type) else {
        record.record_type = RecordType::Other;
        return record;
    };

    let min_width = schema.min_width();
    if content.len() < min_width {
        return skipped(
            record,
            Some(record_type),
            format!(
                "{record_type} line length {} is shorter than the required {min_width}",
                content.len()
            ),
        );
    }

    for spec in schema.fields {
        match decode(content, spec) {
            Ok(Some(value)) => {
                record.fields.insert(
                    spec.start,
                    RecordField {
                        name: spec.name,
                        value,
                    },
                );
            }
            Ok(None) if spec.required => {
                return skipped(
                    record,
                    Some(record_type),
                    format!("required field {} is blank", spec.name),
                );
            }
            Err(reason) if spec.required => {
                return skipped(
                    record,
                    Some(record_type),
                    format!("required field {}: {reason}", spec.name),
                );
            }
            _ => {}
        }
    }

    record.record_type = record_type;
    promote(&mut record);
    record
}

/// Classify every line of a file in order.
pub fn classify_all(lines: &[RawLine]) -> Vec<ClassifiedRecord> {
    lines.iter().map(classify).collect()
}

fn skipped(
    mut record: ClassifiedRecord,
    detected: Option<RecordType>,
    reason: String,
) -> ClassifiedRecord {
    record.record_type = RecordType::Skipped;
    record.skip = Some(SkipReason { detected, reason });
    record
}

fn promote(record: &mut ClassifiedRecord) {
    let mut merchant = None;
    let mut date = None;
    let mut amount = None;
    let mut trace = None;

    for field in record.fields.values() {
        match (field.name, &field.value) {
            (MERCHANT_ACCOUNT, FieldValue::Text(v)) => merchant = Some(v.clone()),
            (TRANSACTION_DATE, FieldValue::Date(v)) => date = Some(*v),
            (TRANSACTION_AMOUNT, FieldValue::Amount(v)) => amount = Some(*v),
            (TRACE_NUMBER, FieldValue::Text(v)) => trace = Some(v.clone()),
            _ => {}
        }
    }

    record.merchant_account_number = merchant;
    record.transaction_date = date;
    record.transaction_amount = amount;
    record.trace_number = trace;
}

/// Decode one field. `Ok(None)` means the field is blank or beyond the end
/// of a line whose trailing spaces were trimmed.
fn decode(content: &[u8], spec: &FieldSpec) -> Result<Option<FieldValue>, String> {
    let range = spec.range();
    if range.start >= content.len() {
        return Ok(None);
    }
    let end = range.end.min(content.len());
    let raw = String::from_utf8_lossy(&content[range.start..end]);
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    match spec.kind {
        FieldKind::Text => Ok(Some(FieldValue::Text(raw.to_string()))),
        FieldKind::Numeric => parse_integer(raw).map(|n| Some(FieldValue::Number(n))),
        FieldKind::Amount => {
            parse_integer(raw).map(|cents| Some(FieldValue::Amount(Amount::from_cents(cents))))
        }
        FieldKind::Date => {
            if raw.bytes().all(|b| b == b'0') {
                return Ok(None);
            }
            NaiveDate::parse_from_str(raw, DATE_FORMAT)
                .map(|d| Some(FieldValue::Date(d)))
                .map_err(|e| format!("invalid date {raw:?}: {e}"))
        }
    }
}

fn parse_integer(raw: &str) -> Result<i64, String> {
    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("{raw:?} is not numeric"));
    }
    raw.parse::<i64>()
        .map_err(|e| format!("{raw:?} is out of range: {e}"))
}
