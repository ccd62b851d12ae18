//! Remaining quantity per purchase-order line.
//!
//! Each gate entry consumes part of a PO line's balance. The ledger keeps the
//! last known remaining quantity per `(po, material)` so an operator cannot
//! receive more than what is left, even before the ERP has caught up.
//! Remaining quantities only go down and never below zero.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LineKey {
    pub po: String,
    pub material: String,
}

impl LineKey {
    pub fn new(po: &str, material: &str) -> Self {
        Self {
            po: po.trim().to_string(),
            material: material.trim().to_string(),
        }
    }
}

impl fmt::Display for LineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}", self.po, self.material)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("PO {po} / {material} is fully consumed")]
    FullyConsumed { po: String, material: String },
    #[error("weight {weight} exceeds remaining {remaining} for PO {po} / {material}")]
    ExceedsRemaining {
        po: String,
        material: String,
        weight: f64,
        remaining: f64,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemainingLedger {
    entries: BTreeMap<LineKey, f64>,
}

impl RemainingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, po: &str, material: &str) -> Option<f64> {
        self.entries.get(&LineKey::new(po, material)).copied()
    }

    /// Store `remaining`. Zero, negative and non-finite values remove the line.
    pub fn set(&mut self, po: &str, material: &str, remaining: f64) {
        let key = LineKey::new(po, material);
        if remaining.is_finite() && remaining > 0.0 {
            self.entries.insert(key, remaining);
        } else {
            debug!(line = %key, remaining, "Ledger line cleared");
            self.entries.remove(&key);
        }
    }

    /// Apply a receipt and return the new remaining quantity.
    ///
    /// The starting point is the stored value, else `form_balance`. When
    /// `received` is not positive the consumption is inferred from a form
    /// balance lower than the starting point. Returns `None` and leaves the
    /// ledger untouched when there is no starting point.
    pub fn consume(
        &mut self,
        po: &str,
        material: &str,
        received: f64,
        form_balance: Option<f64>,
    ) -> Option<f64> {
        let form_balance = form_balance.filter(|b| b.is_finite());
        let previous = self.get(po, material).or(form_balance)?;

        let consumed = if received.is_finite() && received > 0.0 {
            received
        } else {
            match form_balance {
                Some(balance) if balance < previous => previous - balance,
                _ => 0.0,
            }
        };

        let remaining = (previous - consumed).max(0.0);
        // Exhausted lines stay tracked at zero so they read as unavailable.
        self.entries.insert(LineKey::new(po, material), remaining);
        info!(
            po = po.trim(),
            material = material.trim(),
            previous,
            consumed,
            remaining,
            "PO line consumed"
        );
        Some(remaining)
    }

    /// False only for a tracked line with nothing left.
    pub fn is_available(&self, po: &str, material: &str) -> bool {
        self.get(po, material).map_or(true, |r| r > 0.0)
    }

    pub fn validate_line(&self, po: &str, material: &str, weight: f64) -> Result<(), LedgerError> {
        let Some(remaining) = self.get(po, material) else {
            return Ok(());
        };
        if remaining <= 0.0 && weight > 0.0 {
            return Err(LedgerError::FullyConsumed {
                po: po.trim().to_string(),
                material: material.trim().to_string(),
            });
        }
        if weight > remaining {
            return Err(LedgerError::ExceedsRemaining {
                po: po.trim().to_string(),
                material: material.trim().to_string(),
                weight,
                remaining,
            });
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LineKey, f64)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }

    /// `po__material` keyed map for display.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect();
        serde_json::Value::Object(map)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn load(conn: &Connection) -> Result<Self, String> {
        let mut stmt = conn
            .prepare("SELECT po_number, material, remaining FROM po_remaining")
            .map_err(|e| format!("ledger load prepare: {e}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })
            .map_err(|e| format!("ledger load query: {e}"))?;

        let mut ledger = Self::new();
        for row in rows {
            match row {
                Ok((po, material, remaining)) if remaining.is_finite() && remaining >= 0.0 => {
                    ledger
                        .entries
                        .insert(LineKey::new(&po, &material), remaining);
                }
                Ok((po, material, remaining)) => {
                    warn!(po = %po, material = %material, remaining, "Ignoring invalid remaining quantity")
                }
                Err(e) => warn!(error = %e, "Skipping unreadable po_remaining row"),
            }
        }
        Ok(ledger)
    }

    pub fn save(&self, conn: &Connection) -> Result<(), String> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("ledger save begin: {e}"))?;
        tx.execute("DELETE FROM po_remaining", [])
            .map_err(|e| format!("ledger save clear: {e}"))?;
        for (key, remaining) in self.iter() {
            tx.execute(
                "INSERT INTO po_remaining (po_number, material, remaining, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))",
                params![key.po, key.material, remaining],
            )
            .map_err(|e| format!("ledger save insert: {e}"))?;
        }
        tx.commit().map_err(|e| format!("ledger save commit: {e}"))?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_trimmed() {
        let mut l = RemainingLedger::new();
        l.set(" 4500012 ", "IRON-F ", 120.0);
        assert_eq!(l.get("4500012", "IRON-F"), Some(120.0));
        assert_eq!(l.iter().next().unwrap().0.to_string(), "4500012__IRON-F");
        assert_eq!(l.to_json()["4500012__IRON-F"], 120.0);
    }

    #[test]
    fn test_set_non_positive_removes() {
        let mut l = RemainingLedger::new();
        l.set("P", "M", 10.0);
        l.set("P", "M", 0.0);
        assert!(l.is_empty());
        l.set("P", "M", f64::NAN);
        assert_eq!(l.get("P", "M"), None);
        assert!(l.is_available("P", "M"));
    }

    #[test]
    fn test_consume_from_stored_value() {
        let mut l = RemainingLedger::new();
        l.set("P", "M", 100.0);
        assert_eq!(l.consume("P", "M", 30.0, Some(999.0)), Some(70.0));
        assert_eq!(l.consume("P", "M", 30.0, None), Some(40.0));
    }

    #[test]
    fn test_consume_seeds_from_form_balance() {
        let mut l = RemainingLedger::new();
        assert_eq!(l.consume("P", "M", 25.0, Some(60.0)), Some(35.0));
        assert_eq!(l.get("P", "M"), Some(35.0));
    }

    #[test]
    fn test_consume_infers_from_lower_balance() {
        let mut l = RemainingLedger::new();
        l.set("P", "M", 50.0);
        assert_eq!(l.consume("P", "M", 0.0, Some(42.0)), Some(42.0));
        // a higher balance never raises the remaining quantity
        assert_eq!(l.consume("P", "M", 0.0, Some(90.0)), Some(42.0));
    }

    #[test]
    fn test_consume_floors_at_zero() {
        let mut l = RemainingLedger::new();
        l.set("P", "M", 5.0);
        assert_eq!(l.consume("P", "M", 8.0, None), Some(0.0));
        assert!(!l.is_available("P", "M"));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn test_consume_without_starting_point() {
        let mut l = RemainingLedger::new();
        assert_eq!(l.consume("P", "M", 8.0, None), None);
        assert!(l.is_empty());
    }

    #[test]
    fn test_validate_line() {
        let mut l = RemainingLedger::new();
        assert!(l.validate_line("P", "M", 1e9).is_ok());

        l.set("P", "M", 10.0);
        assert!(l.validate_line("P", "M", 10.0).is_ok());
        assert!(matches!(
            l.validate_line("P", "M", 10.5),
            Err(LedgerError::ExceedsRemaining { remaining, .. }) if remaining == 10.0
        ));

        l.consume("P", "M", 10.0, None);
        assert_eq!(
            l.validate_line(" P", "M", 1.0),
            Err(LedgerError::FullyConsumed {
                po: "P".into(),
                material: "M".into()
            })
        );
        assert!(l.validate_line("P", "M", 0.0).is_ok());
    }

    #[test]
    fn test_save_and_load_keep_exhausted_lines() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::run_migrations_for_test(&conn);

        let mut l = RemainingLedger::new();
        l.set("P1", "M1", 12.5);
        l.set("P2", "M2", 3.0);
        l.consume("P2", "M2", 3.0, None);
        l.save(&conn).unwrap();

        let loaded = RemainingLedger::load(&conn).unwrap();
        assert_eq!(loaded, l);
        assert!(!loaded.is_available("P2", "M2"));

        // save replaces, it does not append
        let mut l2 = RemainingLedger::new();
        l2.set("P3", "M3", 1.0);
        l2.save(&conn).unwrap();
        assert_eq!(RemainingLedger::load(&conn).unwrap().len(), 1);
    }
}
