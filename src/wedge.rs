//! Keyboard-wedge barcode scanner buffer.
//!
//! USB/Bluetooth scanners in keyboard mode "type" the label very fast and
//! finish with Enter. The buffer collects those keystrokes outside of text
//! inputs and hands back the complete payload on Enter. A gap longer than the
//! inactivity window means a human is typing, so the partial buffer is
//! dropped.
//!
//! The buffer owns no timers: callers pass the keystroke instant, which keeps
//! it usable from any event loop and deterministic in tests.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Wedge tuning, see [`crate::settings::GateSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WedgeConfig {
    pub inactivity: Duration,
    /// A flush needs strictly more characters than this.
    pub min_length: usize,
}

impl Default for WedgeConfig {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_millis(100),
            min_length: 5,
        }
    }
}

/// A key event as the UI layer reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WedgeKey {
    Char(char),
    Enter,
    /// Modifiers, arrows, function keys.
    Other,
}

/// Where keyboard focus was when the key arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    /// Input or textarea; the keystroke belongs to the operator.
    TextInput,
    Elsewhere,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WedgeAction {
    Ignored,
    Buffered,
    /// Enter after a long enough burst: the scanned payload.
    Flush(String),
    /// Enter after too short a burst; buffer cleared.
    Discarded(String),
}

#[derive(Debug)]
pub struct WedgeBuffer {
    config: WedgeConfig,
    buffer: String,
    last_key_at: Option<Instant>,
}

impl WedgeBuffer {
    pub fn new(config: WedgeConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            last_key_at: None,
        }
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Whether the UI should swallow this key so it doesn't reach the page.
    pub fn should_suppress(&self, key: WedgeKey, focus: Focus) -> bool {
        focus == Focus::Elsewhere && (!self.buffer.is_empty() || key == WedgeKey::Enter)
    }

    pub fn on_key(&mut self, key: WedgeKey, focus: Focus, at: Instant) -> WedgeAction {
        if focus == Focus::TextInput {
            return WedgeAction::Ignored;
        }

        if let Some(stale) = self.poll_idle(at) {
            trace!(len = stale.len(), "Wedge buffer expired before next key");
        }

        match key {
            WedgeKey::Char(c) => {
                self.buffer.push(c);
                self.last_key_at = Some(at);
                WedgeAction::Buffered
            }
            WedgeKey::Enter => {
                let payload = std::mem::take(&mut self.buffer);
                self.last_key_at = None;
                if payload.chars().count() > self.config.min_length {
                    debug!(len = payload.len(), "Wedge scan complete");
                    WedgeAction::Flush(payload)
                } else {
                    WedgeAction::Discarded(payload)
                }
            }
            WedgeKey::Other => WedgeAction::Ignored,
        }
    }

    /// Drop the buffer if the last keystroke is older than the inactivity
    /// window. Returns what was dropped.
    pub fn poll_idle(&mut self, now: Instant) -> Option<String> {
        let last = self.last_key_at?;
        if now.saturating_duration_since(last) <= self.config.inactivity {
            return None;
        }
        self.last_key_at = None;
        let stale = std::mem::take(&mut self.buffer);
        if stale.chars().count() < self.config.min_length {
            debug!(buffer = %stale, "Incomplete wedge scan cleared");
        }
        Some(stale)
    }
}

impl Default for WedgeBuffer {
    fn default() -> Self {
        Self::new(WedgeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_str(buf: &mut WedgeBuffer, text: &str, start: Instant, gap: Duration) -> Instant {
        let mut at = start;
        for c in text.chars() {
            assert_eq!(
                buf.on_key(WedgeKey::Char(c), Focus::Elsewhere, at),
                WedgeAction::Buffered
            );
            at += gap;
        }
        at
    }

    #[test]
    fn test_fast_burst_flushes_on_enter() {
        let mut buf = WedgeBuffer::default();
        let t0 = Instant::now();
        let end = type_str(&mut buf, "P|D|1|M|X|Y", t0, Duration::from_millis(5));
        assert_eq!(
            buf.on_key(WedgeKey::Enter, Focus::Elsewhere, end),
            WedgeAction::Flush("P|D|1|M|X|Y".to_string())
        );
        assert_eq!(buf.pending(), "");
    }

    #[test]
    fn test_short_burst_is_discarded() {
        let mut buf = WedgeBuffer::default();
        let t0 = Instant::now();
        let end = type_str(&mut buf, "12345", t0, Duration::from_millis(5));
        assert_eq!(
            buf.on_key(WedgeKey::Enter, Focus::Elsewhere, end),
            WedgeAction::Discarded("12345".to_string())
        );
    }

    #[test]
    fn test_slow_typing_resets_buffer() {
        let mut buf = WedgeBuffer::default();
        let t0 = Instant::now();
        let end = type_str(&mut buf, "abcdefgh", t0, Duration::from_millis(250));
        // each gap exceeded the window, so only the last key survives
        assert_eq!(buf.pending(), "h");
        assert_eq!(
            buf.on_key(WedgeKey::Enter, Focus::Elsewhere, end),
            WedgeAction::Discarded(String::new())
        );
    }

    #[test]
    fn test_text_input_focus_is_ignored() {
        let mut buf = WedgeBuffer::default();
        let t0 = Instant::now();
        assert_eq!(
            buf.on_key(WedgeKey::Char('a'), Focus::TextInput, t0),
            WedgeAction::Ignored
        );
        assert_eq!(
            buf.on_key(WedgeKey::Enter, Focus::TextInput, t0),
            WedgeAction::Ignored
        );
        assert_eq!(buf.pending(), "");
        assert!(!buf.should_suppress(WedgeKey::Enter, Focus::TextInput));
    }

    #[test]
    fn test_poll_idle_clears_stale_buffer() {
        let mut buf = WedgeBuffer::default();
        let t0 = Instant::now();
        type_str(&mut buf, "abc", t0, Duration::from_millis(1));
        assert_eq!(buf.poll_idle(t0 + Duration::from_millis(50)), None);
        assert_eq!(
            buf.poll_idle(t0 + Duration::from_millis(500)),
            Some("abc".to_string())
        );
        assert_eq!(buf.pending(), "");
        assert_eq!(buf.poll_idle(t0 + Duration::from_secs(5)), None);
    }

    #[test]
    fn test_suppress_only_while_scanning() {
        let mut buf = WedgeBuffer::default();
        let t0 = Instant::now();
        assert!(!buf.should_suppress(WedgeKey::Char('x'), Focus::Elsewhere));
        assert!(buf.should_suppress(WedgeKey::Enter, Focus::Elsewhere));
        buf.on_key(WedgeKey::Char('x'), Focus::Elsewhere, t0);
        assert!(buf.should_suppress(WedgeKey::Char('y'), Focus::Elsewhere));
    }

    #[test]
    fn test_other_keys_do_not_touch_buffer() {
        let mut buf = WedgeBuffer::default();
        let t0 = Instant::now();
        buf.on_key(WedgeKey::Char('x'), Focus::Elsewhere, t0);
        assert_eq!(
            buf.on_key(WedgeKey::Other, Focus::Elsewhere, t0),
            WedgeAction::Ignored
        );
        assert_eq!(buf.pending(), "x");
    }
}
