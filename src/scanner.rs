//! Serial barcode/QR scanner reader for COM port scanners.
//!
//! Complements the keyboard wedge (see [`crate::wedge`]) for gate scanners
//! wired over serial. A background tokio task reads line-terminated payloads
//! and forwards them as [`ScanEvent`]s, so the scan gate treats serial input
//! exactly like any other capture source.

use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::{ScanEvent, ScanSource};
use crate::serial::{self, ReaderError};

/// Accepted payload length. Gate QR labels run far longer than shop barcodes.
const PAYLOAD_LEN: RangeInclusive<usize> = 3..=512;
const MAX_LINE_BUF: usize = 1024;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

static SCANNER_RUNNING: AtomicBool = AtomicBool::new(false);
static SCANNER_HANDLE: Mutex<Option<String>> = Mutex::new(None);
static SCANNER_PORT: Mutex<Option<String>> = Mutex::new(None);
static LAST_SCAN: Mutex<Option<String>> = Mutex::new(None);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerStatus {
    pub connected: bool,
    pub port: Option<String>,
    pub last_scan: Option<String>,
}

// ---------------------------------------------------------------------------
// Line handling
// ---------------------------------------------------------------------------

/// Append `chunk` to `buf` and return the complete payloads it finished.
fn take_payloads(buf: &mut String, chunk: &str) -> Vec<String> {
    // Some scanners terminate with a bare CR.
    buf.push_str(&chunk.replace('\r', "\n"));
    let payloads = serial::drain_lines(buf)
        .into_iter()
        .filter(|line| {
            let ok = PAYLOAD_LEN.contains(&line.chars().count());
            if !ok {
                debug!(len = line.len(), "Serial scanner: ignoring out-of-range line");
            }
            ok
        })
        .collect();

    if buf.len() > MAX_LINE_BUF {
        warn!(len = buf.len(), "Serial scanner: line buffer overflow, clearing");
        buf.clear();
    }
    payloads
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Open `port` and spawn the background reader. Must be called inside a
/// tokio runtime. The reader exits when [`stop`] is called or `tx` has no
/// receiver left.
pub fn start(
    port: &str,
    baud_rate: u32,
    tx: mpsc::UnboundedSender<ScanEvent>,
) -> Result<(), ReaderError> {
    if SCANNER_RUNNING.load(Ordering::SeqCst) {
        return Err(ReaderError::AlreadyRunning("serial scanner"));
    }

    let handle = serial::open_port(port, baud_rate, Some(200))?;

    *SCANNER_HANDLE.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.clone());
    *SCANNER_PORT.lock().unwrap_or_else(|e| e.into_inner()) = Some(port.to_string());

    SCANNER_RUNNING.store(true, Ordering::SeqCst);

    let port_name = port.to_string();

    tokio::spawn(async move {
        info!(port = %port_name, "Serial scanner background reader started");
        let mut line_buf = String::new();

        'reader: while SCANNER_RUNNING.load(Ordering::SeqCst) {
            match serial::read_port(&handle, 256) {
                Ok(data) if !data.is_empty() => {
                    for payload in take_payloads(&mut line_buf, &data) {
                        info!(len = payload.len(), "Serial scanner: payload received");
                        *LAST_SCAN.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(payload.clone());

                        if tx.send(ScanEvent::new(ScanSource::Serial, payload)).is_err() {
                            info!("Serial scanner: receiver dropped, stopping");
                            SCANNER_RUNNING.store(false, Ordering::SeqCst);
                            break 'reader;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Serial scanner read error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        serial::close_port(&handle);
        SCANNER_HANDLE
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        info!(port = %port_name, "Serial scanner background reader stopped");
    });

    Ok(())
}

/// Stop the reader. Returns false if it was not running.
pub fn stop() -> bool {
    if !SCANNER_RUNNING.swap(false, Ordering::SeqCst) {
        return false;
    }

    if let Some(handle) = SCANNER_HANDLE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
    {
        serial::close_port(&handle);
    }

    info!("Serial scanner stopped");
    true
}

pub fn status() -> ScannerStatus {
    ScannerStatus {
        connected: SCANNER_RUNNING.load(Ordering::SeqCst),
        port: SCANNER_PORT
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone(),
        last_scan: LAST_SCAN.lock().unwrap_or_else(|e| e.into_inner()).clone(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
