//! Listening-port detection over the throttled output path.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use regex::Regex;

use crate::observer::OutputListener;
use crate::session::SessionId;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("static regex"))
}

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})\b").expect("static regex")
    })
}

fn phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bport\s*[:=]?\s*(\d{2,5})\b").expect("static regex"))
}

fn parse_port(digits: &str) -> Option<u16> {
    digits.parse::<u16>().ok().filter(|p| *p > 0)
}

/// First listening port announced in `text`, ignoring color codes.
///
/// Recognizes `localhost:3000`, `http://127.0.0.1:8080/`, `[::1]:4000`, and
/// phrases like `listening on port 5173`.
pub fn detect_port(text: &str) -> Option<u16> {
    let plain = ansi_re().replace_all(text, "");
    address_re()
        .captures(&plain)
        .or_else(|| phrase_re().captures(&plain))
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_port(m.as_str()))
}

/// Records the first port each session announces.
#[derive(Debug, Default)]
pub struct PortDetector {
    ports: RwLock<HashMap<SessionId, u16>>,
}

impl PortDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(&self, id: &SessionId) -> Option<u16> {
        self.ports.read().get(id).copied()
    }

    pub fn ports(&self) -> Vec<(SessionId, u16)> {
        self.ports.read().iter().map(|(id, p)| (*id, *p)).collect()
    }
}

impl OutputListener for PortDetector {
    fn on_output(&self, id: SessionId, text: &str) {
        if self.ports.read().contains_key(&id) {
            return;
        }
        if let Some(port) = detect_port(text) {
            tracing::info!(session = %id, port, "detected listening port");
            self.ports.write().entry(id).or_insert(port);
        }
    }

    fn on_session_removed(&self, id: SessionId) {
        self.ports.write().remove(&id);
    }
}
