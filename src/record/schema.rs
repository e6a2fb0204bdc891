//! Fixed-width layout table for TDDF record types.
//!
//! Positions are 1-based and inclusive, as printed in the TDDF layout
//! documentation. Every record starts with the same 23-character header; the
//! record identifier at positions 18-19 selects the rest of the layout.

use super::RecordType;

/// How a field's characters are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Trimmed text; blank is absent.
    Text,
    /// Signed integer.
    Numeric,
    /// Integer cents.
    Amount,
    /// `MMDDCCYY`; blank or all zeros is absent.
    Date,
}

/// One field of a fixed-width layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// 1-based start position.
    pub start: usize,
    pub width: usize,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    const fn new(name: &'static str, start: usize, width: usize, kind: FieldKind) -> Self {
        Self {
            name,
            start,
            width,
            kind,
            required: false,
        }
    }

    const fn text(name: &'static str, start: usize, width: usize) -> Self {
        Self::new(name, start, width, FieldKind::Text)
    }

    const fn numeric(name: &'static str, start: usize, width: usize) -> Self {
        Self::new(name, start, width, FieldKind::Numeric)
    }

    const fn amount(name: &'static str, start: usize, width: usize) -> Self {
        Self::new(name, start, width, FieldKind::Amount)
    }

    const fn date(name: &'static str, start: usize) -> Self {
        Self::new(name, start, 8, FieldKind::Date)
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// 0-based byte range of the field.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start - 1..self.start - 1 + self.width
    }

    /// 1-based inclusive end position.
    pub fn end(&self) -> usize {
        self.start + self.width - 1
    }
}

/// Layout of one record type.
#[derive(Debug)]
pub struct RecordSchema {
    pub record_type: RecordType,
    pub fields: &'static [FieldSpec],
}

impl RecordSchema {
    /// Shortest line that still holds every required field.
    pub fn min_width(&self) -> usize {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(FieldSpec::end)
            .max()
            .unwrap_or(0)
            .max(HEADER_WIDTH)
    }
}

pub const HEADER_WIDTH: usize = 23;

/// Record identifier position in the common header.
pub const IDENTIFIER: FieldSpec = FieldSpec::text("record_identifier", 18, 2);

pub const HEADER: &[FieldSpec] = &[
    FieldSpec::numeric("sequence_number", 1, 7),
    FieldSpec::numeric("entry_run_number", 8, 6),
    FieldSpec::numeric("sequence_within_run", 14, 4),
    IDENTIFIER,
    FieldSpec::numeric("bank_number", 20, 4),
];

// Field names promoted to typed record attributes.
pub const MERCHANT_ACCOUNT: &str = "merchant_account_number";
pub const TRANSACTION_DATE: &str = "transaction_date";
pub const TRANSACTION_AMOUNT: &str = "transaction_amount";
pub const TRACE_NUMBER: &str = "reference_number";

const BH: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::text("association_number", 40, 6),
    FieldSpec::text("group_number", 46, 6),
    FieldSpec::numeric("transaction_code", 52, 4),
    FieldSpec::date("batch_date", 56).required(),
    FieldSpec::numeric("batch_julian_date", 64, 5),
    FieldSpec::amount("net_deposit", 69, 15),
    FieldSpec::text("batch_id", 84, 13),
];

const DT: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::text("association_number", 40, 6),
    FieldSpec::text("group_number", 46, 6),
    FieldSpec::numeric("transaction_code", 52, 4),
    FieldSpec::date("batch_date", 56),
    FieldSpec::numeric("batch_julian_date", 64, 5),
    FieldSpec::amount("net_deposit", 69, 15),
    FieldSpec::text(TRACE_NUMBER, 84, 23).required(),
    FieldSpec::date(TRANSACTION_DATE, 107).required(),
    FieldSpec::amount(TRANSACTION_AMOUNT, 115, 11).required(),
    FieldSpec::text("debit_credit_indicator", 126, 1),
    FieldSpec::text("cardholder_account_number", 127, 19),
    FieldSpec::text("authorization_number", 146, 6),
    FieldSpec::text("card_type", 152, 2),
    FieldSpec::text("merchant_name", 154, 25),
];

const P1: &[FieldSpec] = &[
    FieldSpec::amount("tax_amount", 24, 12).required(),
    FieldSpec::numeric("tax_rate", 36, 7),
    FieldSpec::text("tax_type", 43, 1),
    FieldSpec::text("purchase_identifier", 44, 25),
    FieldSpec::text("customer_code", 69, 15),
];

const P2: &[FieldSpec] = &[
    FieldSpec::amount("discount_amount", 24, 12).required(),
    FieldSpec::amount("freight_amount", 36, 12),
    FieldSpec::amount("duty_amount", 48, 12),
    FieldSpec::text("destination_postal_code", 60, 10),
    FieldSpec::text("destination_country", 70, 3),
];

const E1: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::text("ecommerce_indicator", 40, 2),
    FieldSpec::text("pos_entry_mode", 42, 2),
    FieldSpec::text("terminal_id", 44, 8),
];

const G2: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::numeric("merchant_category_code", 40, 4),
    FieldSpec::text("merchant_city", 44, 13),
    FieldSpec::text("merchant_state", 57, 3),
    FieldSpec::text("merchant_postal_code", 60, 10),
];

const AD: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::date("adjustment_date", 40),
    FieldSpec::amount("adjustment_amount", 48, 11),
    FieldSpec::text("adjustment_reason", 59, 4),
];

const DR: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::date("dispute_date", 40),
    FieldSpec::amount("dispute_amount", 48, 11),
    FieldSpec::text("reason_code", 59, 4),
];

const CK: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::text("check_number", 40, 10),
    FieldSpec::amount("check_amount", 50, 11),
];

const LG: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::date("check_in_date", 40),
    FieldSpec::date("check_out_date", 48),
    FieldSpec::amount("room_rate", 56, 11),
];

const GE: &[FieldSpec] = &[
    FieldSpec::text(MERCHANT_ACCOUNT, 24, 16).required(),
    FieldSpec::text("extension_type", 40, 4),
    FieldSpec::text("extension_data", 44, 40),
];

static SCHEMAS: [RecordSchema; 11] = [
    RecordSchema { record_type: RecordType::BH, fields: BH },
    RecordSchema { record_type: RecordType::DT, fields: DT },
    RecordSchema { record_type: RecordType::P1, fields: P1 },
    RecordSchema { record_type: RecordType::P2, fields: P2 },
    RecordSchema { record_type: RecordType::E1, fields: E1 },
    RecordSchema { record_type: RecordType::G2, fields: G2 },
    RecordSchema { record_type: RecordType::AD, fields: AD },
    RecordSchema { record_type: RecordType::DR, fields: DR },
    RecordSchema { record_type: RecordType::CK, fields: CK },
    RecordSchema { record_type: RecordType::LG, fields: LG },
    RecordSchema { record_type: RecordType::GE, fields: GE },
];

/// Layout for a known record type.
pub fn schema_for(record_type: RecordType) -> Option<&'static RecordSchema> {
    SCHEMAS.iter().find(|s| s.record_type == record_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_known_type_has_schema() {
        for t in RecordType::KNOWN {
            assert!(schema_for(t).is_some(), "missing schema for {t}");
        }
        assert!(schema_for(RecordType::Other).is_none());
    }

    #[test]
    fn test_fields_do_not_overlap() {
        for schema in &SCHEMAS {
            let mut fields: Vec<_> = HEADER.iter().chain(schema.fields).collect();
            fields.sort_by_key(|f| f.start);
            for pair in fields.windows(2) {
                assert!(
                    pair[0].end() < pair[1].start,
                    "{} overlaps {} in {}",
                    pair[0].name,
                    pair[1].name,
                    schema.record_type
                );
            }
        }
    }

    #[test]
    fn test_min_width_follows_required_fields() {
        assert_eq!(schema_for(RecordType::DT).unwrap().min_width(), 125);
        assert_eq!(schema_for(RecordType::BH).unwrap().min_width(), 63);
        assert_eq!(schema_for(RecordType::E1).unwrap().min_width(), 39);
    }

    #[test]
    fn test_identifier_range() {
        assert_eq!(IDENTIFIER.range(), 17..19);
    }
}
