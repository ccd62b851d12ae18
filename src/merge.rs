//! Applying decoded label fields to a form record.
//!
//! Forms (gate entry, QR inward/outward, transfer posting) grew their own
//! field names independently of the label layouts, so a decoded field is
//! routed to form fields through a [`MergeProfile`] instead of assuming the
//! names line up. Merging never overwrites a value the operator already has.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::decoder::{recover_from_remarks, Clock, DecodedFields, Field};

// ---------------------------------------------------------------------------
// Target record
// ---------------------------------------------------------------------------

/// In-memory form state owned by the calling screen.
///
/// A key that exists is a field the form declares; its value may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRecord {
    fields: BTreeMap<String, String>,
}

impl TargetRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record declaring `names`, all empty.
    pub fn with_fields(names: &[&str]) -> Self {
        Self {
            fields: names
                .iter()
                .map(|n| (n.to_string(), String::new()))
                .collect(),
        }
    }

    /// Build from a JSON object as posted by a form. Scalars are stringified,
    /// `null` becomes empty, nested values are skipped.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or("Form record must be a JSON object")?;
        let mut fields = BTreeMap::new();
        for (key, v) in obj {
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                Value::Bool(_) | Value::Number(_) => v.to_string(),
                Value::Array(_) | Value::Object(_) => continue,
            };
            fields.insert(key.clone(), text);
        }
        Ok(Self { fields })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn declares(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Absent or the empty string. Whitespace is a value the operator typed.
    pub fn is_blank(&self, name: &str) -> bool {
        self.get(name).map(str::is_empty).unwrap_or(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for TargetRecord {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// One form field and the decoded fields that may feed it, in priority order.
#[derive(Debug, Clone)]
pub struct Route {
    pub target: &'static str,
    pub sources: Vec<Field>,
    /// Only fill when the form already declares `target` (older call sites).
    pub declared_only: bool,
}

impl Route {
    fn direct(target: &'static str, source: Field) -> Self {
        Self {
            target,
            sources: vec![source],
            declared_only: false,
        }
    }

    fn alias(target: &'static str, source: Field) -> Self {
        Self {
            target,
            sources: vec![source],
            declared_only: true,
        }
    }

    fn with_fallback(target: &'static str, sources: &[Field]) -> Self {
        Self {
            target,
            sources: sources.to_vec(),
            declared_only: false,
        }
    }
}

/// Field routing for one family of forms.
#[derive(Debug, Clone)]
pub struct MergeProfile {
    pub name: &'static str,
    routes: Vec<Route>,
}

/// Form names some screens still use for a decoded field.
const ALIASES: &[(Field, &str)] = &[(Field::Material, "MaterialType")];

impl MergeProfile {
    /// Decoded names map 1:1 onto form names, plus the alias table.
    pub fn identity() -> Self {
        let mut routes: Vec<Route> = Field::ALL
            .iter()
            .map(|f| Route::direct(f.as_str(), *f))
            .collect();
        routes.extend(ALIASES.iter().map(|(f, name)| Route::alias(name, *f)));
        Self {
            name: "identity",
            routes,
        }
    }

    /// The gate-entry header form (create header, QR inward/outward).
    pub fn gate_entry() -> Self {
        let mut routes = vec![
            Route::direct("PermitNumber", Field::PermitNumber),
            Route::direct("VehicleNumber", Field::VehicleNumber),
            Route::direct("GateEntryDate", Field::GateEntryDate),
            Route::direct("InwardTime", Field::InwardTime),
            Route::direct("LRGCNumber", Field::ReferenceNumber),
            Route::direct("Remarks", Field::Remarks),
            Route::direct("Material", Field::Material),
            Route::direct("MaterialDescription", Field::MaterialDescription),
            Route::direct("VendorInvoiceWeight", Field::VendorInvoiceWeight),
            Route::with_fallback(
                "GrossWeight",
                &[Field::GrossWeight, Field::VendorInvoiceWeight],
            ),
            Route::direct("VendorInvoiceNumber", Field::VendorInvoiceNumber),
            Route::direct("Division", Field::Location),
        ];
        routes.extend(ALIASES.iter().map(|(f, name)| Route::alias(name, *f)));
        Self {
            name: "gate_entry",
            routes,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "identity" => Some(Self::identity()),
            "gate_entry" | "gate-entry" => Some(Self::gate_entry()),
            _ => None,
        }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

impl Default for MergeProfile {
    fn default() -> Self {
        Self::identity()
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// What a merge touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Form fields that received a value, in routing order.
    pub changed: Vec<String>,
}

impl MergeOutcome {
    /// Whether to show "scan applied" rather than "no new data".
    pub fn applied(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Fill empty form fields from `decoded`; non-empty ones are left untouched.
pub fn merge_into(
    target: &mut TargetRecord,
    decoded: &DecodedFields,
    profile: &MergeProfile,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for route in &profile.routes {
        if route.declared_only && !target.declares(route.target) {
            continue;
        }
        if !target.is_blank(route.target) {
            continue;
        }
        let Some(value) = route.sources.iter().find_map(|f| decoded.get(*f)) else {
            continue;
        };
        target.set(route.target, value);
        outcome.changed.push(route.target.to_string());
    }

    debug!(
        profile = profile.name,
        changed = outcome.changed.len(),
        "Decoded fields merged into form"
    );
    outcome
}

/// [`merge_into`] with the identity profile.
pub fn apply(target: &mut TargetRecord, decoded: &DecodedFields) -> MergeOutcome {
    merge_into(target, decoded, &MergeProfile::identity())
}

/// If the form's Remarks holds a whole pasted label, fill the other empty
/// fields from it. Remarks itself is never rewritten.
pub fn merge_pasted_remarks(
    target: &mut TargetRecord,
    profile: &MergeProfile,
    clock: &dyn Clock,
) -> MergeOutcome {
    let Some(remarks) = target.get("Remarks").map(str::to_string) else {
        return MergeOutcome::default();
    };
    match recover_from_remarks(&remarks, clock) {
        Some(decoded) => merge_into(target, &decoded, profile),
        None => MergeOutcome::default(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
