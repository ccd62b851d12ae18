//! Layout detection.
//!
//! Both layouts are pipe-delimited with similar field counts; they diverge at
//! index 3, which holds a `DD/MM/YYYY H:MM AM` timestamp on legacy labels and
//! a material name on current ones. This is the single place that decides.

use regex::Regex;
use std::sync::OnceLock;

use super::{DecodeError, PayloadFormat};

/// Fewest segments either layout can be recognised from.
pub const MIN_SEGMENTS: usize = 5;

/// Index of the segment that tells the layouts apart.
const DISCRIMINATOR_INDEX: usize = 3;

fn legacy_timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // `\d` would also take non-ASCII digits the date parser then rejects.
        Regex::new(r"^[0-9]{1,2}/[0-9]{1,2}/[0-9]{4}\s+[0-9]{1,2}:[0-9]{1,2}")
            .expect("legacy timestamp pattern compiles")
    })
}

/// Split a payload on `|` and trim every segment.
pub fn split_segments(raw: &str) -> Vec<String> {
    raw.split('|').map(|s| s.trim().to_string()).collect()
}

/// Whether a segment looks like a legacy combined date/time.
pub(crate) fn looks_like_legacy_timestamp(segment: &str) -> bool {
    legacy_timestamp_pattern().is_match(segment)
}

/// Decide the layout of `raw` and hand back its split segments.
pub fn detect(raw: &str) -> Result<(PayloadFormat, Vec<String>), DecodeError> {
    let parts = split_segments(raw);
    if parts.len() < MIN_SEGMENTS {
        return Err(DecodeError::MalformedPayload {
            segments: parts.len(),
        });
    }

    let format = if looks_like_legacy_timestamp(&parts[DISCRIMINATOR_INDEX]) {
        PayloadFormat::Legacy
    } else {
        PayloadFormat::Current
    };
    Ok((format, parts))
}
