//! In-memory data model mirrored from the printer fleet (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Fluid level as reported by `^SU`'s `INK:`/`MAKEUP:` fields.
///
/// An unrecognised token maps to `Unknown`, which is distinct from
/// `Empty` — spec §4.5 invariant: "An unknown ink/makeup level maps to
/// `UNKNOWN`; it is not treated as EMPTY."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluidLevel {
    Full,
    Good,
    Low,
    Empty,
    Unknown,
}

impl FluidLevel {
    pub fn parse(token: &str) -> Self {
        match token.trim().to_ascii_uppercase().as_str() {
            "FULL" => FluidLevel::Full,
            "GOOD" => FluidLevel::Good,
            "LOW" => FluidLevel::Low,
            "EMPTY" => FluidLevel::Empty,
            _ => FluidLevel::Unknown,
        }
    }
}

/// Derived reachability status a mirror can be in (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyState {
    Ready,
    NotReady,
    Error,
    Offline,
}

/// Print-head orientation (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    Normal,
    Mirror,
    Flip,
    MirrorFlip,
    Tower,
    TowerFlip,
    TowerMirror,
    TowerMirrorFlip,
}

/// Print speed (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speed {
    Fast,
    Faster,
    Fastest,
    UltraFast,
}

/// Print mode (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintMode {
    Normal,
    Auto,
    Repeat,
    Reverse,
}

/// Per-printer observed state the HMI reads (spec §3).
///
/// Invariants enforced by construction/update sites, not by this type
/// alone:
/// - `offline ⇒ ¬available` (§3a)
/// - `ready` only ever set from a confirmed `Print Status: Ready` line
///   within the last poll (§3b)
/// - a mirror for the connected printer is never flipped to `offline` by
///   the Availability Supervisor alone (§3c) — enforced in
///   `availability.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterMirror {
    pub identity_id: u32,
    pub available: bool,
    pub ready_state: ReadyState,
    pub has_active_errors: bool,
    pub ink_level: FluidLevel,
    pub makeup_level: FluidLevel,
    pub current_message: Option<String>,
    pub last_print_count: Option<u32>,
}

impl PrinterMirror {
    pub fn new(identity_id: u32) -> Self {
        Self {
            identity_id,
            available: false,
            ready_state: ReadyState::Offline,
            has_active_errors: false,
            ink_level: FluidLevel::Unknown,
            makeup_level: FluidLevel::Unknown,
            current_message: None,
            last_print_count: None,
        }
    }

    /// Enforces invariant (a): offline implies not available.
    pub fn mark_offline(&mut self) {
        self.available = false;
        self.ready_state = ReadyState::Offline;
    }
}

/// Live status fields from the connected printer (spec §3, `^SU`/others).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    pub hv_on: bool,
    pub jet_running: bool,
    pub product_count: u32,
    pub print_count: u32,
    pub custom_counts: [u32; 4],
    pub current_message: Option<String>,
    pub firmware_version: Option<String>,
    pub device_clock: Option<DateTime<Utc>>,
    pub ink_level: FluidLevel,
    pub makeup_level: FluidLevel,
}

impl Default for FluidLevel {
    fn default() -> Self {
        FluidLevel::Unknown
    }
}

/// Ink-system telemetry reported by `^SU`/`^TP` (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub power_hours_minutes: Option<(u32, u32)>,
    pub stream_hours_minutes: Option<(u32, u32)>,
    pub modulation: Option<i32>,
    pub viscosity: Option<f32>,
    pub charge: Option<i32>,
    pub pressure: Option<i32>,
    pub rotations_per_second: Option<f32>,
    pub phase_quality: Option<i32>,
    pub hv_deflection: bool,
    pub print_status: Option<String>,
    pub allow_errors: bool,
    pub error_active: bool,
    pub printhead_temp: Option<f32>,
    pub electronics_temp: Option<f32>,
    pub v300up: bool,
    pub vlt_on: bool,
    pub gut_on: bool,
    pub mod_on: bool,
}

/// Per-message persistent print settings (spec §3, §4.2.5 `^CM`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub width: u32,
    pub height: u32,
    pub delay: u32,
    pub rotation: Rotation,
    pub bold: u8,
    pub speed: Speed,
    pub gap: u8,
    pub pitch: u32,
    pub repeat_amount: u32,
    pub print_mode: PrintMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            delay: 0,
            rotation: Rotation::Normal,
            bold: 0,
            speed: Speed::Fast,
            gap: 0,
            pitch: 0,
            repeat_amount: 0,
            print_mode: PrintMode::Normal,
        }
    }
}

/// One entry in the printer's stored message catalog (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: u32,
    pub name: String,
}

/// Ordered, name-deduplicated (case-insensitive) message catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageCatalog {
    entries: Vec<MessageEntry>,
}

impl MessageCatalog {
    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn contains(&self, name: &str) -> bool {
        let upper = name.to_ascii_uppercase();
        self.entries.iter().any(|m| m.name.eq_ignore_ascii_case(&upper))
    }

    /// Insert, deduplicated by uppercased name (spec §3 invariant,
    /// property 6 in §8). Returns `true` if a new entry was added.
    pub fn insert(&mut self, id: u32, name: &str) -> bool {
        let upper = name.trim().to_ascii_uppercase();
        if self.entries.iter().any(|m| m.name == upper) {
            return false;
        }
        self.entries.push(MessageEntry { id, name: upper });
        true
    }

    pub fn remove(&mut self, name: &str) {
        let upper = name.trim().to_ascii_uppercase();
        self.entries.retain(|m| m.name != upper);
    }

    /// Replace the whole catalog, e.g. after a fresh `^LM` parse.
    pub fn replace_all(&mut self, entries: Vec<MessageEntry>) {
        let mut seen = std::collections::HashSet::new();
        self.entries = entries
            .into_iter()
            .filter(|e| seen.insert(e.name.clone()))
            .collect();
    }
}

/// State that exists at most once, iff a printer is connected (spec §3).
#[derive(Debug, Clone)]
pub struct ConnectedState {
    pub identity_id: u32,
    pub status: Status,
    pub metrics: Metrics,
    pub settings: Settings,
    pub messages: MessageCatalog,
}

impl ConnectedState {
    pub fn new(identity_id: u32) -> Self {
        Self {
            identity_id,
            status: Status::default(),
            metrics: Metrics::default(),
            settings: Settings::default(),
            messages: MessageCatalog::default(),
        }
    }
}

/// Direction of a logged command-protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogDirection {
    Sent,
    Received,
}

/// One append-only diagnostic record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub direction: LogDirection,
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub response: Option<String>,
}

/// Mapping from identity → consecutive-offline count, used solely by the
/// Availability Supervisor's hysteresis (spec §3).
#[derive(Debug, Clone, Default)]
pub struct FleetReachabilityCounter {
    streaks: BTreeMap<u32, u32>,
}

impl FleetReachabilityCounter {
    pub fn reset(&mut self, id: u32) {
        self.streaks.insert(id, 0);
    }

    /// Increment and return the new streak length.
    pub fn increment(&mut self, id: u32) -> u32 {
        let entry = self.streaks.entry(id).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn streak(&self, id: u32) -> u32 {
        self.streaks.get(&id).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, id: u32) {
        self.streaks.remove(&id);
    }
}

/// Bounded, shareable append log of every command sent to and response
/// received from the connected printer (spec §3, diagnostic surface).
/// Oldest entries fall off once `capacity` is reached.
pub struct CommandLog {
    capacity: usize,
    entries: Mutex<VecDeque<CommandLogEntry>>,
}

impl CommandLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))) }
    }

    pub fn push(&self, direction: LogDirection, command: String, response: Option<String>) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(CommandLogEntry { direction, timestamp: Utc::now(), command, response });
    }

    pub fn snapshot(&self) -> Vec<CommandLogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fluid_level_unknown_is_not_empty() {
        assert_eq!(FluidLevel::parse("garbage"), FluidLevel::Unknown);
        assert_ne!(FluidLevel::parse("garbage"), FluidLevel::Empty);
    }

    #[test]
    fn fluid_level_parses_known_tokens() {
        assert_eq!(FluidLevel::parse("full"), FluidLevel::Full);
        assert_eq!(FluidLevel::parse("GOOD"), FluidLevel::Good);
        assert_eq!(FluidLevel::parse("Low"), FluidLevel::Low);
        assert_eq!(FluidLevel::parse("EMPTY"), FluidLevel::Empty);
    }

    #[test]
    fn message_catalog_dedupes_by_uppercase_name() {
        let mut cat = MessageCatalog::default();
        assert!(cat.insert(1, "bestcode"));
        assert!(!cat.insert(2, "BESTCODE"));
        assert_eq!(cat.entries().len(), 1);
        assert_eq!(cat.entries()[0].name, "BESTCODE");
    }

    #[test]
    fn mirror_mark_offline_clears_available() {
        let mut mirror = PrinterMirror::new(1);
        mirror.available = true;
        mirror.mark_offline();
        assert!(!mirror.available);
        assert_eq!(mirror.ready_state, ReadyState::Offline);
    }
}
