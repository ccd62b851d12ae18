//! Serial port pool for gate peripherals.
//!
//! Weighbridge indicators and serial barcode scanners are reached over
//! COM/tty ports. Each opened port gets a UUID handle and callers refer to
//! ports by handle rather than raw port name, so a reader task and a command
//! (e.g. tare) can share one connection.

use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("failed to list ports: {0}")]
    Enumerate(#[source] serialport::Error),
    #[error("failed to open {port} @ {baud}: {source}")]
    Open {
        port: String,
        baud: u32,
        #[source]
        source: serialport::Error,
    },
    #[error("no open port with handle {0}")]
    UnknownHandle(String),
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the background peripheral readers.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("{0} already running, stop it first")]
    AlreadyRunning(&'static str),
    #[error("{0} not connected")]
    NotConnected(&'static str),
    #[error(transparent)]
    Serial(#[from] SerialError),
}

/// A port as reported by the OS.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub name: String,
    pub port_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

type PortMap = HashMap<String, Box<dyn serialport::SerialPort>>;

static PORT_POOL: Mutex<Option<PortMap>> = Mutex::new(None);

fn pool() -> MutexGuard<'static, Option<PortMap>> {
    PORT_POOL.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn list_ports() -> Result<Vec<PortInfo>, SerialError> {
    let ports = serialport::available_ports().map_err(SerialError::Enumerate)?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let (port_type, manufacturer, product) = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => ("usb", usb.manufacturer, usb.product),
                serialport::SerialPortType::BluetoothPort => ("bluetooth", None, None),
                serialport::SerialPortType::PciPort => ("pci", None, None),
                serialport::SerialPortType::Unknown => ("unknown", None, None),
            };
            PortInfo {
                name: p.port_name,
                port_type,
                manufacturer,
                product,
            }
        })
        .collect())
}

/// Open `port` and return its pool handle. Reads time out after `timeout_ms`
/// (default 1000).
pub fn open_port(port: &str, baud: u32, timeout_ms: Option<u64>) -> Result<String, SerialError> {
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(1000));
    let serial = serialport::new(port, baud)
        .timeout(timeout)
        .open()
        .map_err(|source| SerialError::Open {
            port: port.to_string(),
            baud,
            source,
        })?;

    let handle = Uuid::new_v4().to_string();
    pool()
        .get_or_insert_with(HashMap::new)
        .insert(handle.clone(), serial);

    info!(port = port, baud = baud, handle = %handle, "Serial port opened");
    Ok(handle)
}

pub fn write_port(handle: &str, data: &[u8]) -> Result<usize, SerialError> {
    let mut guard = pool();
    let port = guard
        .get_or_insert_with(HashMap::new)
        .get_mut(handle)
        .ok_or_else(|| SerialError::UnknownHandle(handle.to_string()))?;
    let written = port.write(data)?;
    port.flush()?;
    Ok(written)
}

/// Read up to `max_bytes` as lossy UTF-8. A read timeout yields an empty
/// string, not an error.
pub fn read_port(handle: &str, max_bytes: usize) -> Result<String, SerialError> {
    let mut guard = pool();
    let port = guard
        .get_or_insert_with(HashMap::new)
        .get_mut(handle)
        .ok_or_else(|| SerialError::UnknownHandle(handle.to_string()))?;

    let mut buf = vec![0u8; max_bytes.min(4096)];
    match port.read(&mut buf) {
        Ok(n) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Close a handle. Returns false for unknown handles.
pub fn close_port(handle: &str) -> bool {
    let mut guard = pool();
    let removed = guard
        .get_or_insert_with(HashMap::new)
        .remove(handle)
        .is_some();
    if removed {
        info!(handle = handle, "Serial port closed");
    } else {
        warn!(handle = handle, "Close called on unknown handle");
    }
    removed
}

/// Close every open port (process shutdown).
pub fn close_all() {
    let mut guard = pool();
    if let Some(map) = guard.as_mut() {
        let count = map.len();
        map.clear();
        if count > 0 {
            info!(count = count, "Closed all serial ports");
        }
    }
}

pub fn is_open(handle: &str) -> bool {
    pool()
        .as_ref()
        .map(|m| m.contains_key(handle))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Line framing
// ---------------------------------------------------------------------------

/// Move every complete `\n`-terminated line out of `buf`, trimmed.
/// Blank lines are dropped; the unterminated tail stays in `buf`.
pub fn drain_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim().to_string();
        buf.drain(..=pos);
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_list_ports_does_not_panic() {
        // CI machines may have no ports at all; enumeration failing is fine too.
        let _ = list_ports();
    }

    #[test]
    fn test_open_nonexistent_port_fails() {
        let err = open_port("/dev/gatescan-no-such-port", 9600, Some(10)).unwrap_err();
        assert!(matches!(err, SerialError::Open { baud: 9600, .. }));
    }

    #[test]
    #[serial]
    fn test_unknown_handle_errors() {
        assert!(matches!(
            read_port("no-such-handle", 256),
            Err(SerialError::UnknownHandle(_))
        ));
        assert!(matches!(
            write_port("no-such-handle", b"T\r\n"),
            Err(SerialError::UnknownHandle(_))
        ));
        assert!(!close_port("no-such-handle"));
        assert!(!is_open("no-such-handle"));
    }

    #[test]
    fn test_drain_lines_keeps_partial_tail() {
        let mut buf = "ABC|1\r\n\r\nDEF|2\nGH".to_string();
        assert_eq!(drain_lines(&mut buf), vec!["ABC|1".to_string(), "DEF|2".into()]);
        assert_eq!(buf, "GH");
        buf.push_str("I\n");
        assert_eq!(drain_lines(&mut buf), vec!["GHI".to_string()]);
        assert!(buf.is_empty());
    }
}
