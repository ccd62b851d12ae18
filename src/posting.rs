//! Shapes a filled gate-entry record into the field formats the ERP
//! OData service accepts. Nothing here talks to the network.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;

use crate::merge::TargetRecord;
use crate::weighbridge::{normalize_decimal, Weighment};

const TIME_FIELDS: &[&str] = &["InwardTime", "OutwardTime"];
const WEIGHT_FIELDS: &[&str] = &["GrossWeight", "TareWeight", "NetWeight", "VendorInvoiceWeight"];
const DATE_FIELD: &str = "GateEntryDate";

fn hhmmss_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{2}):(\d{2}):(\d{2})$").expect("hhmmss regex"))
}

/// `"09:05:00"` → `"PT9H5M0S"`. Text that is not `HH:MM:SS` (including an
/// existing duration) passes through; blank gives `None`.
pub fn sap_duration(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let Some(caps) = hhmmss_re().captures(value) else {
        return Some(value.to_string());
    };
    let part = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
    Some(format!("PT{}H{}M{}S", part(1), part(2), part(3)))
}

/// Zero-padded duration for a wall-clock time, e.g. `PT09H05M00S`.
pub fn sap_duration_from(time: NaiveTime) -> String {
    format!(
        "PT{:02}H{:02}M{:02}S",
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// `"PT9H5M"` → `"09:05:00"`. Non-duration text passes through.
pub fn hhmmss_from_sap_duration(value: &str) -> String {
    static UNIT: OnceLock<Regex> = OnceLock::new();
    let re = UNIT.get_or_init(|| Regex::new(r"(\d+)([HMS])").expect("duration regex"));
    if !value.starts_with("PT") {
        return value.to_string();
    }
    let (mut h, mut m, mut s) = (0u32, 0u32, 0u32);
    for caps in re.captures_iter(value) {
        let n = caps[1].parse::<u32>().unwrap_or(0);
        match &caps[2] {
            "H" => h = n,
            "M" => m = n,
            _ => s = n,
        }
    }
    format!("{h:02}:{m:02}:{s:02}")
}

/// ERP Edm.DateTime form of a `YYYY-MM-DD` date.
fn sap_date(date: NaiveDate) -> String {
    format!("{}T00:00:00", date.format("%Y-%m-%d"))
}

/// Build the posting body from `record`.
///
/// Every declared field is carried over as a string, then the date, time and
/// weight fields are converted. `FiscalYear` follows the entry date (or `now`
/// when the date is unusable) unless the record already has one. `NetWeight`
/// is computed whenever gross and tare are both valid.
pub fn posting_payload(record: &TargetRecord, now: NaiveDateTime) -> Value {
    let mut body: Map<String, Value> = record
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();

    let entry_date = record
        .get(DATE_FIELD)
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());
    match entry_date {
        Some(date) => {
            body.insert(DATE_FIELD.into(), Value::String(sap_date(date)));
        }
        None if record.declares(DATE_FIELD) => {
            debug!(value = ?record.get(DATE_FIELD), "Entry date not ISO, posting null");
            body.insert(DATE_FIELD.into(), Value::Null);
        }
        None => {}
    }

    if record.is_blank("FiscalYear") {
        let year = entry_date.map_or(now.year(), |d| d.year());
        body.insert("FiscalYear".into(), Value::String(year.to_string()));
    }

    for field in TIME_FIELDS {
        if let Some(raw) = record.get(field) {
            let value = sap_duration(raw).map_or(Value::Null, Value::String);
            body.insert((*field).into(), value);
        }
    }

    for field in WEIGHT_FIELDS {
        if let Some(raw) = record.get(field) {
            let value = normalize_decimal(raw).map_or(Value::Null, Value::String);
            body.insert((*field).into(), value);
        }
    }

    let weighment = Weighment::from_text(
        record.get("GrossWeight").unwrap_or_default(),
        record.get("TareWeight").unwrap_or_default(),
    );
    if let Some(net) = weighment.net_text() {
        body.insert("NetWeight".into(), Value::String(net));
    }

    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(9, 5, 0)
            .unwrap()
    }

    #[test]
    fn test_sap_duration() {
        assert_eq!(sap_duration("09:05:00").as_deref(), Some("PT9H5M0S"));
        assert_eq!(sap_duration("23:59:59").as_deref(), Some("PT23H59M59S"));
        assert_eq!(sap_duration("PT1H2M3S").as_deref(), Some("PT1H2M3S"));
        assert_eq!(sap_duration("9:05").as_deref(), Some("9:05"));
        assert_eq!(sap_duration("  "), None);
    }

    #[test]
    fn test_sap_duration_from_time() {
        let t = NaiveTime::from_hms_opt(9, 5, 0).unwrap();
        assert_eq!(sap_duration_from(t), "PT09H05M00S");
    }

    #[test]
    fn test_duration_back_to_clock_time() {
        assert_eq!(hhmmss_from_sap_duration("PT9H5M0S"), "09:05:00");
        assert_eq!(hhmmss_from_sap_duration("PT14H"), "14:00:00");
        assert_eq!(hhmmss_from_sap_duration("10:00:00"), "10:00:00");
    }

    #[test]
    fn test_posting_payload_converts_fields() {
        let record = TargetRecord::from([
            ("VehicleNumber", "KA35D7399"),
            ("GateEntryDate", "2025-07-20"),
            ("InwardTime", "08:30:00"),
            ("GrossWeight", "42,105"),
            ("TareWeight", "16200"),
            ("VendorInvoiceWeight", "19.26 "),
        ]);
        let body = posting_payload(&record, now());
        assert_eq!(body["VehicleNumber"], "KA35D7399");
        assert_eq!(body["GateEntryDate"], "2025-07-20T00:00:00");
        assert_eq!(body["FiscalYear"], "2025");
        assert_eq!(body["InwardTime"], "PT8H30M0S");
        assert_eq!(body["GrossWeight"], "42105");
        assert_eq!(body["VendorInvoiceWeight"], "19.26");
        assert_eq!(body["NetWeight"], "25905.000");
    }

    #[test]
    fn test_posting_payload_invalid_values_become_null() {
        let record = TargetRecord::from([
            ("GateEntryDate", "20/07/2025"),
            ("InwardTime", ""),
            ("GrossWeight", "heavy"),
        ]);
        let body = posting_payload(&record, now());
        assert_eq!(body["GateEntryDate"], Value::Null);
        assert_eq!(body["InwardTime"], Value::Null);
        assert_eq!(body["GrossWeight"], Value::Null);
        assert_eq!(body["FiscalYear"], "2026");
        assert!(body.get("NetWeight").is_none());
    }

    #[test]
    fn test_posting_payload_keeps_existing_fiscal_year() {
        let record = TargetRecord::from([("FiscalYear", "2024"), ("GateEntryDate", "2025-01-02")]);
        let body = posting_payload(&record, now());
        assert_eq!(
            body,
            json!({"FiscalYear": "2024", "GateEntryDate": "2025-01-02T00:00:00"})
        );
    }
}
