//! Typed view over the terminal's `local_settings` rows.
//!
//! Settings are stored as category/key/value strings (see [`crate::db`]).
//! Unknown or unparsable values fall back to defaults with a warning rather
//! than refusing to start the gate terminal.

use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::db;
use crate::weighbridge::IndicatorProtocol;
use crate::wedge::WedgeConfig;

pub const DEFAULT_BAUD: u32 = 9600;
pub const DEFAULT_LOG_FILTER: &str = "info,gatescan_lib=debug";

/// Env var overriding the data directory.
pub const DATA_DIR_ENV: &str = "GATESCAN_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateSettings {
    pub scanner_port: Option<String>,
    pub scanner_baud: u32,
    pub wedge: WedgeConfig,
    pub scale_port: Option<String>,
    pub scale_baud: u32,
    pub scale_protocol: IndicatorProtocol,
    pub log_filter: String,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            scanner_port: None,
            scanner_baud: DEFAULT_BAUD,
            wedge: WedgeConfig::default(),
            scale_port: None,
            scale_baud: DEFAULT_BAUD,
            scale_protocol: IndicatorProtocol::Generic,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl GateSettings {
    pub fn load(conn: &Connection) -> Self {
        let d = Self::default();
        let wedge_ms = parsed(conn, "wedge", "inactivity_ms")
            .map(Duration::from_millis)
            .unwrap_or(d.wedge.inactivity);
        Self {
            scanner_port: text(conn, "scanner", "port"),
            scanner_baud: parsed(conn, "scanner", "baud").unwrap_or(d.scanner_baud),
            wedge: WedgeConfig {
                inactivity: wedge_ms,
                min_length: parsed(conn, "wedge", "min_length").unwrap_or(d.wedge.min_length),
            },
            scale_port: text(conn, "scale", "port"),
            scale_baud: parsed(conn, "scale", "baud").unwrap_or(d.scale_baud),
            scale_protocol: text(conn, "scale", "protocol")
                .map(|p| IndicatorProtocol::from_name(&p))
                .unwrap_or(d.scale_protocol),
            log_filter: text(conn, "logging", "filter").unwrap_or(d.log_filter),
        }
    }
}

fn text(conn: &Connection, category: &str, key: &str) -> Option<String> {
    db::get_setting(conn, category, key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(conn: &Connection, category: &str, key: &str) -> Option<T> {
    let raw = text(conn, category, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(category, key, value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}

/// Where the database lives: `$GATESCAN_DATA_DIR`, else the platform data dir.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    platform_data_dir().join("gatescan")
}

pub(crate) fn platform_data_dir() -> PathBuf {
    std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn test_defaults_on_empty_db() {
        assert_eq!(GateSettings::load(&conn()), GateSettings::default());
    }

    #[test]
    fn test_load_stored_values() {
        let c = conn();
        db::set_setting(&c, "scanner", "port", " /dev/ttyACM0 ").unwrap();
        db::set_setting(&c, "scanner", "baud", "115200").unwrap();
        db::set_setting(&c, "wedge", "inactivity_ms", "60").unwrap();
        db::set_setting(&c, "wedge", "min_length", "8").unwrap();
        db::set_setting(&c, "scale", "protocol", "toledo").unwrap();

        let s = GateSettings::load(&c);
        assert_eq!(s.scanner_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(s.scanner_baud, 115200);
        assert_eq!(s.wedge.inactivity, Duration::from_millis(60));
        assert_eq!(s.wedge.min_length, 8);
        assert_eq!(s.scale_protocol, IndicatorProtocol::Toledo);
        assert_eq!(s.scale_port, None);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let c = conn();
        db::set_setting(&c, "scanner", "baud", "fast").unwrap();
        db::set_setting(&c, "scanner", "port", "   ").unwrap();
        let s = GateSettings::load(&c);
        assert_eq!(s.scanner_baud, DEFAULT_BAUD);
        assert_eq!(s.scanner_port, None);
    }
}
