//! Legacy label layout (10 fields, embedded 12-hour timestamp).

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use super::{segment, Clock, DecodeWarning, DecodedFields, Field, PayloadFormat};

const PERMIT: usize = 0;
const DOCUMENT: usize = 1;
const WEIGHT: usize = 2;
const DATE_TIME: usize = 3;
const VEHICLE: usize = 4;
const VEHICLE_TYPE: usize = 5;
const MATERIAL: usize = 6;
const MATERIAL_DESC: usize = 7;
const REFERENCE: usize = 8;
const LOCATION: usize = 9;

/// Parse `DD/MM/YYYY H:MM AM|PM` into a date and a minute-precision time.
///
/// The meridiem may be omitted, in which case the hour is read as 24-hour.
/// A `:SS` suffix on the time is accepted and ignored.
/// Returns `None` for anything that is not a real calendar date and clock time.
pub fn parse_combined_datetime(raw: &str) -> Option<NaiveDateTime> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let (date_part, time_part, meridiem) = match tokens.as_slice() {
        [d, t] => (*d, *t, None),
        [d, t, m] => (*d, *t, Some(*m)),
        _ => return None,
    };

    let mut date_fields = date_part.split('/');
    let day: u32 = date_fields.next()?.parse().ok()?;
    let month: u32 = date_fields.next()?.parse().ok()?;
    let year: i32 = date_fields.next()?.parse().ok()?;
    if date_fields.next().is_some() {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)?;

    let mut clock_fields = time_part.split(':');
    let hour: u32 = clock_fields.next()?.parse().ok()?;
    let minute: u32 = clock_fields.next()?.parse().ok()?;
    // Seconds are validated and dropped.
    if let Some(seconds) = clock_fields.next() {
        seconds.parse::<u32>().ok().filter(|s| *s < 60)?;
    }
    if clock_fields.next().is_some() {
        return None;
    }

    let hour = match meridiem.map(str::to_ascii_uppercase).as_deref() {
        None => hour,
        Some(m) if !(1..=12).contains(&hour) => {
            tracing::trace!(meridiem = m, hour, "12-hour clock value out of range");
            return None;
        }
        Some("PM") if hour != 12 => hour + 12,
        Some("AM") if hour == 12 => 0,
        Some("AM") | Some("PM") => hour,
        Some(_) => return None,
    };
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;

    Some(date.and_time(time))
}

pub(super) fn extract(parts: &[String], clock: &dyn Clock) -> DecodedFields {
    let mut out = DecodedFields::new(PayloadFormat::Legacy);

    out.put_segment(Field::PermitNumber, parts, PERMIT);
    out.put_segment(Field::DocumentNumber, parts, DOCUMENT);
    out.put_segment(Field::VendorInvoiceWeight, parts, WEIGHT);
    if let Some(vehicle) = segment(parts, VEHICLE) {
        // Scanners and printers sometimes space out plate numbers.
        let compact: String = vehicle.chars().filter(|c| !c.is_whitespace()).collect();
        out.put(Field::VehicleNumber, compact);
    }
    out.put_segment(Field::VehicleType, parts, VEHICLE_TYPE);
    out.put_segment(Field::Material, parts, MATERIAL);
    out.put_segment(Field::MaterialDescription, parts, MATERIAL_DESC);
    out.put_segment(Field::ReferenceNumber, parts, REFERENCE);
    out.put_segment(Field::Location, parts, LOCATION);

    if let Some(raw) = segment(parts, DATE_TIME) {
        let stamp = match parse_combined_datetime(raw) {
            Some(stamp) => stamp,
            None => {
                out.warnings.push(DecodeWarning::DateTimeFallback {
                    raw: raw.to_string(),
                });
                clock.now()
            }
        };
        out.put(Field::GateEntryDate, stamp.format("%Y-%m-%d").to_string());
        out.put(Field::InwardTime, stamp.format("%H:%M:00").to_string());
    }

    out.put(Field::Remarks, remarks(parts));
    out
}

/// `Material - Description | Location: loc | Weight: w`, skipping blanks.
fn remarks(parts: &[String]) -> String {
    let material = [segment(parts, MATERIAL), segment(parts, MATERIAL_DESC)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" - ");

    let mut pieces: Vec<String> = Vec::new();
    if !material.is_empty() {
        pieces.push(material);
    }
    if let Some(loc) = segment(parts, LOCATION) {
        pieces.push(format!("Location: {loc}"));
    }
    if let Some(weight) = segment(parts, WEIGHT) {
        pieces.push(format!("Weight: {weight}"));
    }
    pieces.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{split_segments, FixedClock};

    fn clock() -> FixedClock {
        FixedClock(
            NaiveDate::from_ymd_opt(2026, 10, 16)
                .unwrap()
                .and_hms_opt(18, 45, 31)
                .unwrap(),
        )
    }

    fn stamp(raw: &str) -> Option<String> {
        parse_combined_datetime(raw).map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
    }

    #[test]
    fn test_parse_pm_adds_twelve() {
        assert_eq!(stamp("16/10/2025 9:23 PM").as_deref(), Some("2025-10-16 21:23:00"));
    }

    #[test]
    fn test_parse_noon_and_midnight() {
        assert_eq!(stamp("1/1/2025 12:00 PM").as_deref(), Some("2025-01-01 12:00:00"));
        assert_eq!(stamp("1/1/2025 12:30 AM").as_deref(), Some("2025-01-01 00:30:00"));
        assert_eq!(stamp("1/1/2025 11:59 AM").as_deref(), Some("2025-01-01 11:59:00"));
    }

    #[test]
    fn test_parse_lowercase_meridiem() {
        assert_eq!(stamp("05/06/2024 3:07 pm").as_deref(), Some("2024-06-05 15:07:00"));
    }

    #[test]
    fn test_parse_ignores_seconds() {
        assert_eq!(stamp("16/10/2025 9:23:45 PM").as_deref(), Some("2025-10-16 21:23:00"));
        assert_eq!(stamp("16/10/2025 9:23:75 PM"), None);
        assert_eq!(stamp("16/10/2025 9:23:45:01 PM"), None);
    }

    #[test]
    fn test_parse_single_digit_minute() {
        assert_eq!(stamp("16/10/2025 9:5 PM").as_deref(), Some("2025-10-16 21:05:00"));
    }

    #[test]
    fn test_parse_24_hour_without_meridiem() {
        assert_eq!(stamp("05/06/2024 15:07").as_deref(), Some("2024-06-05 15:07:00"));
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert_eq!(stamp("32/13/2025 25:99 XX"), None);
        assert_eq!(stamp("31/02/2025 9:00 AM"), None);
        assert_eq!(stamp("16/10/2025 13:00 PM"), None);
        assert_eq!(stamp("16/10/2025 0:10 AM"), None);
        assert_eq!(stamp("16/10/2025 9:23 XM"), None);
        assert_eq!(stamp("16/10/2025"), None);
        assert_eq!(stamp("16/10/2025 9:23 PM extra"), None);
        assert_eq!(stamp("16/10 9:23 PM"), None);
        assert_eq!(stamp("16/10/2025/1 9:23 PM"), None);
    }

    #[test]
    fn test_extract_full_label() {
        let parts = split_segments(
            "25267031B000010|25267031T004063|19.26|16/10/2025 9:23 PM|KA35D 7399|Tipper|Iron Ore|Fines 55-58%|MTE123930103|Yerabanahalli - 583130",
        );
        let d = extract(&parts, &clock());
        assert_eq!(d.get(Field::PermitNumber), Some("25267031B000010"));
        assert_eq!(d.get(Field::DocumentNumber), Some("25267031T004063"));
        assert_eq!(d.get(Field::VehicleType), Some("Tipper"));
        assert_eq!(d.get(Field::ReferenceNumber), Some("MTE123930103"));
        assert_eq!(d.get(Field::Location), Some("Yerabanahalli - 583130"));
        assert_eq!(
            d.get(Field::Remarks),
            Some("Iron Ore - Fines 55-58% | Location: Yerabanahalli - 583130 | Weight: 19.26")
        );
        assert!(!d.contains(Field::GrossWeight));
        assert!(!d.contains(Field::VendorInvoiceNumber));
        assert!(d.warnings.is_empty());
    }

    #[test]
    fn test_extract_vehicle_number_strips_all_whitespace() {
        let parts = split_segments("P|D|1|16/10/2025 9:23 PM|KA 35 D\t7399|T|M|MD|R|L");
        let d = extract(&parts, &clock());
        assert_eq!(d.get(Field::VehicleNumber), Some("KA35D7399"));
    }

    #[test]
    fn test_extract_missing_fields_are_absent() {
        let parts = split_segments("P||19.26|16/10/2025 9:23 PM|");
        let d = extract(&parts, &clock());
        assert!(!d.contains(Field::DocumentNumber));
        assert!(!d.contains(Field::VehicleNumber));
        assert!(!d.contains(Field::Material));
        assert!(!d.contains(Field::Location));
        assert_eq!(d.get(Field::Remarks), Some("Weight: 19.26"));
        assert_eq!(d.get(Field::GateEntryDate), Some("2025-10-16"));
    }

    #[test]
    fn test_remarks_description_without_material() {
        let parts = split_segments("P|D||16/10/2025 9:23 PM|V|T||Fines|R|");
        assert_eq!(remarks(&parts), "Fines");
    }

    #[test]
    fn test_remarks_empty_when_nothing_to_say() {
        let parts = split_segments("P|D||16/10/2025 9:23 PM|V");
        let d = extract(&parts, &clock());
        assert!(!d.contains(Field::Remarks));
    }

    #[test]
    fn test_extract_keeps_seconds_stamped_time() {
        let parts = split_segments("P|D|1|16/10/2025 9:23:45 PM|V");
        let d = extract(&parts, &clock());
        assert_eq!(d.get(Field::InwardTime), Some("21:23:00"));
        assert!(!d.time_auto_filled());
    }

    #[test]
    fn test_extract_fallback_uses_clock_minutes() {
        let parts = split_segments("P|D|1|99/99/9999 9:99 PM|V");
        let d = extract(&parts, &clock());
        assert_eq!(d.get(Field::GateEntryDate), Some("2026-10-16"));
        assert_eq!(d.get(Field::InwardTime), Some("18:45:00"));
        assert!(d.time_auto_filled());
    }
}
