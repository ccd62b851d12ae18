//! Current label layout (9 fields, no timestamp).

use super::{segment, DecodedFields, Field, PayloadFormat};

const PERMIT: usize = 0;
const WEIGHT: usize = 2;
const MATERIAL: usize = 3;
const MATERIAL_DESC: usize = 4;
const VENDOR_INVOICE: usize = 5;
const LOCATION_1: usize = 6;
const LOCATION_2: usize = 8;

pub(super) fn extract(parts: &[String]) -> DecodedFields {
    let mut out = DecodedFields::new(PayloadFormat::Current);

    out.put_segment(Field::PermitNumber, parts, PERMIT);
    // One measured weight; no tare is known at scan time.
    out.put_segment(Field::VendorInvoiceWeight, parts, WEIGHT);
    out.put_segment(Field::GrossWeight, parts, WEIGHT);
    out.put_segment(Field::Material, parts, MATERIAL);
    out.put_segment(Field::MaterialDescription, parts, MATERIAL_DESC);
    out.put_segment(Field::VendorInvoiceNumber, parts, VENDOR_INVOICE);
    out.put_segment(Field::Location, parts, LOCATION_1);

    let remarks = [segment(parts, LOCATION_1), segment(parts, LOCATION_2)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" | ");
    out.put(Field::Remarks, remarks);

    out
}
