//! Weighbridge indicator driver and weighment arithmetic.
//!
//! Indicators stream ASCII weight frames over a serial port:
//! - **Toledo/Mettler-Toledo**: `ST,GS,+ 18.420t\r\n` continuous output
//! - **CAS**: `S  S    18420 kg\r\n`
//! - **Generic**: first signed decimal on the line plus an optional unit
//!
//! The background reader only publishes a reading when the value moves, and
//! the last reading is cached so the gate form can pull it on demand.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::serial::{self, ReaderError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorProtocol {
    Toledo,
    Cas,
    Generic,
}

impl IndicatorProtocol {
    /// Unknown names fall back to `Generic`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "toledo" | "mettler" | "mettler-toledo" => Self::Toledo,
            "cas" => Self::Cas,
            _ => Self::Generic,
        }
    }

    /// Zero command understood by the indicator.
    fn tare_command(self) -> &'static [u8] {
        match self {
            Self::Cas => b"Z\r\n",
            Self::Toledo | Self::Generic => b"T\r\n",
        }
    }
}

impl fmt::Display for IndicatorProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Toledo => "toledo",
            Self::Cas => "cas",
            Self::Generic => "generic",
        })
    }
}

/// A single frame from the indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightReading {
    pub weight: f64,
    pub unit: String,
    pub stable: bool,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeighbridgeStatus {
    pub connected: bool,
    pub port: Option<String>,
    pub protocol: Option<IndicatorProtocol>,
    pub last_reading: Option<WeightReading>,
    pub last_read_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

static BRIDGE_RUNNING: AtomicBool = AtomicBool::new(false);
static BRIDGE_STATUS: Mutex<Option<WeighbridgeStatus>> = Mutex::new(None);
static BRIDGE_HANDLE: Mutex<Option<String>> = Mutex::new(None);

/// Readings closer than this are treated as unchanged.
const DEBOUNCE_EPSILON: f64 = 0.001;

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// `ST,GS,+ 18.420t`: ST stable / US unstable, GS gross / NT net.
fn parse_toledo(line: &str) -> Option<WeightReading> {
    let trimmed = line.trim();
    if trimmed.len() < 8 {
        return None;
    }
    let mut parts = trimmed.splitn(3, ',');
    let state = parts.next()?;
    let _mode = parts.next()?;
    let (num, unit) = extract_number_and_unit(parts.next()?.trim());
    Some(WeightReading {
        weight: num.parse().ok()?,
        unit: unit.to_lowercase(),
        stable: state == "ST",
        raw: trimmed.to_string(),
    })
}

/// `S  S    18420 kg`: leading S stable, U unstable.
fn parse_cas(line: &str) -> Option<WeightReading> {
    let trimmed = line.trim();
    let stable = trimmed.starts_with('S');
    let (num, unit) = extract_number_and_unit(trimmed);
    Some(WeightReading {
        weight: num.parse().ok()?,
        unit: unit.to_lowercase(),
        stable,
        raw: trimmed.to_string(),
    })
}

/// No stability flag in generic frames; unit defaults to kg.
fn parse_generic(line: &str) -> Option<WeightReading> {
    let trimmed = line.trim();
    let (num, unit) = extract_number_and_unit(trimmed);
    Some(WeightReading {
        weight: num.parse().ok()?,
        unit: if unit.is_empty() {
            "kg".to_string()
        } else {
            unit.to_lowercase()
        },
        stable: true,
        raw: trimmed.to_string(),
    })
}

/// First signed decimal in `s` and the letters that follow it.
/// Whitespace between the sign and the digits is allowed.
fn extract_number_and_unit(s: &str) -> (String, String) {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER.get_or_init(|| {
        Regex::new(r"([+-])?\s*(\d+(?:\.\d*)?|\.\d+)\s*([A-Za-z]*)").expect("number regex")
    });
    let Some(caps) = re.captures(s) else {
        return (String::new(), String::new());
    };
    let mut num = String::new();
    if caps.get(1).map(|m| m.as_str()) == Some("-") {
        num.push('-');
    }
    num.push_str(&caps[2]);
    (num, caps[3].to_string())
}

pub fn parse_weight_line(line: &str, protocol: IndicatorProtocol) -> Option<WeightReading> {
    match protocol {
        IndicatorProtocol::Toledo => parse_toledo(line),
        IndicatorProtocol::Cas => parse_cas(line),
        IndicatorProtocol::Generic => parse_generic(line),
    }
}

// ---------------------------------------------------------------------------
// Weighment
// ---------------------------------------------------------------------------

/// Gross and tare for one vehicle visit, in the same unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Weighment {
    pub gross: Option<f64>,
    pub tare: Option<f64>,
}

impl Weighment {
    /// Parse both sides with [`normalize_decimal`]; bad text counts as missing.
    pub fn from_text(gross: &str, tare: &str) -> Self {
        let num = |s: &str| normalize_decimal(s).and_then(|v| v.parse::<f64>().ok());
        Self {
            gross: num(gross),
            tare: num(tare),
        }
    }

    /// Gross minus tare rounded to 3 decimals.
    pub fn net(&self) -> Option<f64> {
        let net = self.gross? - self.tare?;
        Some((net * 1000.0).round() / 1000.0)
    }

    /// Net as posted to the ERP, always 3 decimals.
    pub fn net_text(&self) -> Option<String> {
        self.net().map(|n| format!("{n:.3}"))
    }
}

/// Strip thousands separators and whitespace; accept `-?\d+(\.\d+)?`.
///
/// `"18,420.5 "` becomes `"18420.5"`, `"12kg"` is rejected.
pub fn normalize_decimal(raw: &str) -> Option<String> {
    static DECIMAL: OnceLock<Regex> = OnceLock::new();
    let re = DECIMAL.get_or_init(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("decimal regex"));
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    re.is_match(&cleaned).then_some(cleaned)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Open the indicator port and start the background reader. Readings that
/// differ from the previous one are sent on `tx`; a dropped receiver only
/// stops the publishing, the cached reading keeps updating.
pub fn connect(
    port: &str,
    baud_rate: u32,
    protocol: IndicatorProtocol,
    tx: Option<mpsc::UnboundedSender<WeightReading>>,
) -> Result<(), ReaderError> {
    if BRIDGE_RUNNING.load(Ordering::SeqCst) {
        return Err(ReaderError::AlreadyRunning("weighbridge"));
    }

    let handle = serial::open_port(port, baud_rate, Some(200))?;

    *BRIDGE_HANDLE.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.clone());
    *BRIDGE_STATUS.lock().unwrap_or_else(|e| e.into_inner()) = Some(WeighbridgeStatus {
        connected: true,
        port: Some(port.to_string()),
        protocol: Some(protocol),
        last_reading: None,
        last_read_at: None,
    });

    BRIDGE_RUNNING.store(true, Ordering::SeqCst);

    let port_name = port.to_string();

    tokio::spawn(async move {
        info!(port = %port_name, protocol = %protocol, "Weighbridge reader started");
        let mut last_weight: Option<f64> = None;
        let mut line_buf = String::new();
        let mut tx = tx;

        while BRIDGE_RUNNING.load(Ordering::SeqCst) {
            match serial::read_port(&handle, 256) {
                Ok(data) if !data.is_empty() => {
                    line_buf.push_str(&data);
                    for line in serial::drain_lines(&mut line_buf) {
                        let Some(reading) = parse_weight_line(&line, protocol) else {
                            debug!(line = %line, "Unparsable indicator frame");
                            continue;
                        };
                        if !record_reading(&mut last_weight, &reading) {
                            continue;
                        }
                        if let Some(sender) = &tx {
                            if sender.send(reading).is_err() {
                                debug!("Weighbridge listener gone");
                                tx = None;
                            }
                        }
                    }
                    if line_buf.len() > 1024 {
                        line_buf.clear();
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Weighbridge read error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        serial::close_port(&handle);
        info!(port = %port_name, "Weighbridge reader stopped");
    });

    Ok(())
}

/// Cache `reading` when it moved past the debounce. Returns whether it did.
fn record_reading(last_weight: &mut Option<f64>, reading: &WeightReading) -> bool {
    let changed = last_weight
        .map(|lw| (lw - reading.weight).abs() > DEBOUNCE_EPSILON)
        .unwrap_or(true);
    if !changed {
        return false;
    }
    *last_weight = Some(reading.weight);
    if let Some(status) = BRIDGE_STATUS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_mut()
    {
        status.last_reading = Some(reading.clone());
        status.last_read_at = Some(Utc::now().to_rfc3339());
    }
    true
}

/// Stop the reader. Returns false if it was not connected.
pub fn disconnect() -> bool {
    if !BRIDGE_RUNNING.swap(false, Ordering::SeqCst) {
        return false;
    }

    if let Some(handle) = BRIDGE_HANDLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
    {
        serial::close_port(&handle);
    }
    *BRIDGE_STATUS.lock().unwrap_or_else(|e| e.into_inner()) =
        Some(WeighbridgeStatus::default());

    info!("Weighbridge disconnected");
    true
}

/// Last cached reading. `Ok(None)` while connected but nothing parsed yet.
pub fn read_weight() -> Result<Option<WeightReading>, ReaderError> {
    let guard = BRIDGE_STATUS.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(status) if status.connected => Ok(status.last_reading.clone()),
        _ => Err(ReaderError::NotConnected("weighbridge")),
    }
}

pub fn tare() -> Result<(), ReaderError> {
    let handle = BRIDGE_HANDLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or(ReaderError::NotConnected("weighbridge"))?;
    let protocol = BRIDGE_STATUS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .and_then(|s| s.protocol)
        .unwrap_or(IndicatorProtocol::Generic);

    serial::write_port(&handle, protocol.tare_command())?;
    info!(protocol = %protocol, "Weighbridge tare command sent");
    Ok(())
}

pub fn status() -> WeighbridgeStatus {
    BRIDGE_STATUS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_default()
}

// ===========================================================================
// Tests
// ===========================================================================
