//! Scan intake shared by every capture source.
//!
//! Camera polling, image upload, the keyboard wedge and serial scanners all
//! produce candidate payload strings, sometimes racing each other. A
//! [`ScanGate`] decodes candidates and latches on the first good one so the
//! same form never gets two scans applied in quick succession.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decoder::{decode_with_clock, Clock, DecodeError, DecodedFields, LocalClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanSource {
    Camera,
    Upload,
    Wedge,
    Serial,
}

impl fmt::Display for ScanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanSource::Camera => "camera",
            ScanSource::Upload => "upload",
            ScanSource::Wedge => "wedge",
            ScanSource::Serial => "serial",
        };
        f.write_str(s)
    }
}

/// One raw candidate from a capture source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub raw: String,
    pub source: ScanSource,
    pub timestamp: DateTime<Utc>,
}

impl ScanEvent {
    pub fn new(source: ScanSource, raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            source,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Accepted(DecodedFields),
    /// Not a label; the source may keep trying.
    Rejected(DecodeError),
    /// A scan was already accepted; candidate dropped.
    Closed,
}

/// Latches on the first successfully decoded candidate until re-armed.
#[derive(Debug)]
pub struct ScanGate<C: Clock = LocalClock> {
    clock: C,
    accepted_from: Option<ScanSource>,
}

impl ScanGate<LocalClock> {
    pub fn new() -> Self {
        Self::with_clock(LocalClock)
    }
}

impl Default for ScanGate<LocalClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> ScanGate<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            accepted_from: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.accepted_from.is_none()
    }

    pub fn accepted_from(&self) -> Option<ScanSource> {
        self.accepted_from
    }

    pub fn submit(&mut self, source: ScanSource, raw: &str) -> GateOutcome {
        if let Some(first) = self.accepted_from {
            debug!(source = %source, accepted_from = %first, "Scan gate closed, candidate dropped");
            return GateOutcome::Closed;
        }
        match decode_with_clock(raw, &self.clock) {
            Ok(decoded) => {
                info!(source = %source, format = %decoded.format, "Scan accepted");
                self.accepted_from = Some(source);
                GateOutcome::Accepted(decoded)
            }
            Err(e) => {
                debug!(source = %source, error = %e, "Scan candidate rejected");
                GateOutcome::Rejected(e)
            }
        }
    }

    /// Open the gate for the next form.
    pub fn rearm(&mut self) {
        self.accepted_from = None;
    }
}

/// Feed events from `rx` through `gate` until one is accepted.
///
/// Returns `None` when `cancel` fires or every sender is gone. Rejected
/// candidates are passed to `on_reject` so a UI can show "no valid code".
pub async fn first_accepted<C: Clock>(
    rx: &mut mpsc::UnboundedReceiver<ScanEvent>,
    gate: &mut ScanGate<C>,
    cancel: &CancellationToken,
    mut on_reject: impl FnMut(&ScanEvent, &DecodeError),
) -> Option<(ScanEvent, DecodedFields)> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return None,
            ev = rx.recv() => ev?,
        };
        match gate.submit(event.source, &event.raw) {
            GateOutcome::Accepted(decoded) => return Some((event, decoded)),
            GateOutcome::Rejected(e) => on_reject(&event, &e),
            GateOutcome::Closed => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scan log
// ---------------------------------------------------------------------------

/// A row of the local scan history.
#[derive(Debug, Clone, Serialize)]
pub struct ScanLogEntry {
    pub id: i64,
    pub source: String,
    pub format: Option<String>,
    pub raw: String,
    pub time_auto_filled: bool,
    pub error: Option<String>,
    pub scanned_at: String,
}

/// Append a scan attempt to `scan_log`.
pub fn record_scan(
    conn: &Connection,
    event: &ScanEvent,
    result: Result<&DecodedFields, &DecodeError>,
) -> Result<(), String> {
    let (format, fallback, error) = match result {
        Ok(d) => (Some(d.format.to_string()), d.time_auto_filled(), None),
        Err(e) => (None, false, Some(e.to_string())),
    };
    conn.execute(
        "INSERT INTO scan_log (source, format, raw, time_auto_filled, error, scanned_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.source.to_string(),
            format,
            event.raw,
            fallback,
            error,
            event.timestamp.to_rfc3339(),
        ],
    )
    .map_err(|e| format!("record_scan: {e}"))?;
    Ok(())
}

/// Most recent scans first.
pub fn recent_scans(conn: &Connection, limit: usize) -> Result<Vec<ScanLogEntry>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, source, format, raw, time_auto_filled, error, scanned_at
             FROM scan_log ORDER BY id DESC LIMIT ?1",
        )
        .map_err(|e| format!("recent_scans prepare: {e}"))?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(ScanLogEntry {
                id: row.get(0)?,
                source: row.get(1)?,
                format: row.get(2)?,
                raw: row.get(3)?,
                time_auto_filled: row.get(4)?,
                error: row.get(5)?,
                scanned_at: row.get(6)?,
            })
        })
        .map_err(|e| format!("recent_scans query: {e}"))?;

    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(entry) => out.push(entry),
            Err(e) => warn!(error = %e, "Skipping unreadable scan_log row"),
        }
    }
    Ok(out)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{FixedClock, PayloadFormat};
    use chrono::NaiveDate;

    const LABEL: &str = "P1|X|19.26|Iron Ore|Fines|INV1|Hospet|dup|Yard";

    fn gate() -> ScanGate<FixedClock> {
        ScanGate::with_clock(FixedClock(
            NaiveDate::from_ymd_opt(2026, 5, 5)
                .unwrap()
                .and_hms_opt(5, 5, 5)
                .unwrap(),
        ))
    }

    #[test]
    fn test_gate_latches_on_first_success() {
        let mut g = gate();
        assert!(matches!(
            g.submit(ScanSource::Camera, "noise"),
            GateOutcome::Rejected(DecodeError::MalformedPayload { segments: 1 })
        ));
        assert!(g.is_open());
        assert!(matches!(
            g.submit(ScanSource::Wedge, LABEL),
            GateOutcome::Accepted(_)
        ));
        assert_eq!(g.accepted_from(), Some(ScanSource::Wedge));
        assert_eq!(g.submit(ScanSource::Camera, LABEL), GateOutcome::Closed);
        g.rearm();
        assert!(matches!(
            g.submit(ScanSource::Serial, LABEL),
            GateOutcome::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn test_first_accepted_skips_rejects() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ScanEvent::new(ScanSource::Camera, "A|B")).unwrap();
        tx.send(ScanEvent::new(ScanSource::Serial, LABEL)).unwrap();
        tx.send(ScanEvent::new(ScanSource::Camera, LABEL)).unwrap();

        let mut g = gate();
        let cancel = CancellationToken::new();
        let mut rejects = 0;
        let (event, decoded) = first_accepted(&mut rx, &mut g, &cancel, |_, _| rejects += 1)
            .await
            .unwrap();
        assert_eq!(rejects, 1);
        assert_eq!(event.source, ScanSource::Serial);
        assert_eq!(decoded.format, PayloadFormat::Current);
        // the racing camera candidate is still queued, untouched
        assert_eq!(rx.try_recv().unwrap().source, ScanSource::Camera);
    }

    #[tokio::test]
    async fn test_first_accepted_stops_on_cancel() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<ScanEvent>();
        let mut g = gate();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(first_accepted(&mut rx, &mut g, &cancel, |_, _| {}).await.is_none());
    }

    #[tokio::test]
    async fn test_first_accepted_ends_when_sources_close() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ScanEvent>();
        drop(tx);
        let mut g = gate();
        let cancel = CancellationToken::new();
        assert!(first_accepted(&mut rx, &mut g, &cancel, |_, _| {}).await.is_none());
    }

    #[test]
    fn test_scan_log_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::run_migrations_for_test(&conn);

        let good = ScanEvent::new(ScanSource::Wedge, LABEL);
        let decoded = gate().submit_owned(LABEL);
        record_scan(&conn, &good, Ok(&decoded)).unwrap();

        let bad = ScanEvent::new(ScanSource::Camera, "A|B|C");
        let err = DecodeError::MalformedPayload { segments: 3 };
        record_scan(&conn, &bad, Err(&err)).unwrap();

        let rows = recent_scans(&conn, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].source, "camera");
        assert!(rows[0].error.as_deref().unwrap().contains("found 3"));
        assert_eq!(rows[1].format.as_deref(), Some("current"));
        assert!(!rows[1].time_auto_filled);
        assert_eq!(recent_scans(&conn, 1).unwrap().len(), 1);
    }

    impl ScanGate<FixedClock> {
        fn submit_owned(&mut self, raw: &str) -> DecodedFields {
            match self.submit(ScanSource::Wedge, raw) {
                GateOutcome::Accepted(d) => d,
                other => panic!("expected accepted scan, got {other:?}"),
            }
        }
    }
}
