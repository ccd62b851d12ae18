//! Recovery of label data pasted into a free-text Remarks field.

use super::{decode_with_clock, Clock, DecodedFields, Field};

/// Pipes a remarks string needs before it is treated as a pasted label.
const MIN_PIPES: usize = 4;

/// Decode a Remarks value that holds a whole label, e.g. text typed by a
/// scanner while the cursor sat in the Remarks box.
///
/// The synthesized Remarks field is dropped so the operator's text stays.
pub fn recover_from_remarks(remarks: &str, clock: &dyn Clock) -> Option<DecodedFields> {
    if remarks.matches('|').count() < MIN_PIPES {
        return None;
    }
    let mut decoded = decode_with_clock(remarks, clock).ok()?;
    decoded.remove(Field::Remarks);
    Some(decoded)
}
