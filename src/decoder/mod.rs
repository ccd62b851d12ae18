//! QR / barcode payload decoder for gate-entry labels.
//!
//! Turns the raw text read from a QR code, an uploaded label image or a
//! hardware scanner into a flat set of gate-entry fields. Two pipe-delimited
//! label layouts are in circulation:
//!
//! - **Legacy** (10 fields): `Permit|DocRef|Weight|DD/MM/YYYY H:MM AM|Vehicle|VehicleType|Material|MaterialDesc|RefNumber|Location`
//! - **Current** (9 fields): `Permit|Unused|Weight|Material|MaterialDesc|VendorInvoiceNumber|Location1|UnusedDup|Location2`
//!
//! Decoding is a pure pipeline: split → detect layout → extract fields.
//! The only hidden input is the clock, used when a legacy label carries a
//! corrupt timestamp; callers that need determinism use [`decode_with_clock`].

mod current;
mod detect;
mod legacy;
mod remarks;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use detect::{detect, split_segments, MIN_SEGMENTS};
pub use legacy::parse_combined_datetime;
pub use remarks::recover_from_remarks;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Label layout, derived from each payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// 10 fields, combined date/time at index 3
    Legacy,
    /// 9 fields, material name at index 3
    Current,
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadFormat::Legacy => f.write_str("legacy"),
            PayloadFormat::Current => f.write_str("current"),
        }
    }
}

/// A gate-entry field a payload can carry.
///
/// Serialized names match the field names used by the gate-entry forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Field {
    PermitNumber,
    DocumentNumber,
    ReferenceNumber,
    VehicleNumber,
    VehicleType,
    Material,
    MaterialDescription,
    VendorInvoiceNumber,
    VendorInvoiceWeight,
    GrossWeight,
    Location,
    GateEntryDate,
    InwardTime,
    Remarks,
}

impl Field {
    pub const ALL: [Field; 14] = [
        Field::PermitNumber,
        Field::DocumentNumber,
        Field::ReferenceNumber,
        Field::VehicleNumber,
        Field::VehicleType,
        Field::Material,
        Field::MaterialDescription,
        Field::VendorInvoiceNumber,
        Field::VendorInvoiceWeight,
        Field::GrossWeight,
        Field::Location,
        Field::GateEntryDate,
        Field::InwardTime,
        Field::Remarks,
    ];

    /// Wire / form name of the field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::PermitNumber => "PermitNumber",
            Field::DocumentNumber => "DocumentNumber",
            Field::ReferenceNumber => "ReferenceNumber",
            Field::VehicleNumber => "VehicleNumber",
            Field::VehicleType => "VehicleType",
            Field::Material => "Material",
            Field::MaterialDescription => "MaterialDescription",
            Field::VendorInvoiceNumber => "VendorInvoiceNumber",
            Field::VendorInvoiceWeight => "VendorInvoiceWeight",
            Field::GrossWeight => "GrossWeight",
            Field::Location => "Location",
            Field::GateEntryDate => "GateEntryDate",
            Field::InwardTime => "InwardTime",
            Field::Remarks => "Remarks",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recoverable conditions hit while decoding. The decode still succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodeWarning {
    /// The legacy timestamp could not be parsed; GateEntryDate/InwardTime
    /// hold the wall-clock time of the decode instead.
    DateTimeFallback { raw: String },
}

/// The only unrecoverable decode failure: not enough segments for any layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("no valid code detected: expected at least {MIN_SEGMENTS} pipe-delimited fields, found {segments}")]
    MalformedPayload { segments: usize },
}

/// Structured result of decoding one payload.
///
/// Fields missing from the source payload are absent from `fields`, never
/// stored as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedFields {
    pub format: PayloadFormat,
    pub fields: BTreeMap<Field, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DecodeWarning>,
}

impl DecodedFields {
    pub fn new(format: PayloadFormat) -> Self {
        Self {
            format,
            fields: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when GateEntryDate/InwardTime were filled from the clock.
    pub fn time_auto_filled(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, DecodeWarning::DateTimeFallback { .. }))
    }

    /// Store a value unless it is blank.
    pub(crate) fn put(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.fields.insert(field, value);
        }
    }

    /// Store the segment at `index`, if present and non-blank.
    pub(crate) fn put_segment(&mut self, field: Field, parts: &[String], index: usize) {
        if let Some(value) = segment(parts, index) {
            self.fields.insert(field, value.to_string());
        }
    }

    pub(crate) fn remove(&mut self, field: Field) -> Option<String> {
        self.fields.remove(&field)
    }
}

/// Non-blank segment at `index`.
pub(crate) fn segment(parts: &[String], index: usize) -> Option<&str> {
    parts
        .get(index)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for the legacy timestamp fallback.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall clock of the gate terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Decode a scanned payload using the local wall clock for timestamp fallback.
pub fn decode(raw: &str) -> Result<DecodedFields, DecodeError> {
    decode_with_clock(raw, &LocalClock)
}

/// Decode a scanned payload.
///
/// Fails only with [`DecodeError::MalformedPayload`]; missing fields and a
/// corrupt legacy timestamp are tolerated.
pub fn decode_with_clock(raw: &str, clock: &dyn Clock) -> Result<DecodedFields, DecodeError> {
    let (format, parts) = detect(raw)?;
    let decoded = match format {
        PayloadFormat::Legacy => legacy::extract(&parts, clock),
        PayloadFormat::Current => current::extract(&parts),
    };

    if decoded.time_auto_filled() {
        tracing::warn!(
            format = %format,
            "Legacy label timestamp unreadable, using terminal clock"
        );
    }
    tracing::debug!(format = %format, fields = decoded.len(), "Payload decoded");
    Ok(decoded)
}

// ===========================================================================
// Tests
// ===========================================================================
