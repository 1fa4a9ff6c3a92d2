//! Pure, stateless protocol codec (spec §4.2). No I/O, no state: every
//! function here is a parser from response text to a typed record, or a
//! formatter from parameters to an outbound command. Parsers are lenient —
//! they accept whichever of the three observed dialects the device used
//! and return `None`/leave fields `None` only when nothing recognisable
//! is present.

use crate::model::{FluidLevel, MessageEntry, PrintMode, Rotation, Speed};
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// The literal sentinel the device appends to end a response (spec §6).
pub const EOL_SENTINEL: &str = "//EOL";

fn strip_eol(text: &str) -> &str {
    text.trim_end_matches(|c| c == '\r' || c == '\n')
        .strip_suffix(EOL_SENTINEL)
        .map(|s| s.trim_end_matches(|c| c == '\r' || c == '\n'))
        .unwrap_or(text)
}

// ---------------------------------------------------------------------
// ^SU — status
// ---------------------------------------------------------------------

/// Everything the `^SU` parser can recognise. Every field is optional:
/// a field absent from the response is left `None`/`false`, never
/// fabricated (spec §4.5: "a `^SU` that parses to nothing ⇒ no change").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuFields {
    pub v300up: Option<bool>,
    pub vlt_on: Option<bool>,
    pub gut_on: Option<bool>,
    pub mod_on: Option<bool>,
    pub modulation: Option<i32>,
    pub charge: Option<i32>,
    pub pressure: Option<i32>,
    pub rotations_per_second: Option<f32>,
    pub phase_quality: Option<i32>,
    pub hv_deflection: Option<bool>,
    pub viscosity: Option<f32>,
    pub error_active: Option<bool>,
    pub allow_errors: Option<bool>,
    pub ink_level: Option<FluidLevel>,
    pub makeup_level: Option<FluidLevel>,
    /// Uppercased `Ready`/`Not Ready`/… — the authoritative ready signal
    /// (spec §4.2.1: HVD alone is insufficient).
    pub print_status: Option<String>,
    pub current_message: Option<String>,
    pub power_hours_minutes: Option<(u32, u32)>,
    pub stream_hours_minutes: Option<(u32, u32)>,
}

impl SuFields {
    pub fn is_empty(&self) -> bool {
        *self == SuFields::default()
    }

    pub fn is_ready(&self) -> bool {
        self.print_status.as_deref() == Some("READY")
    }
}

static RE_FLAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(V300UP|VLT_ON|GUT_ON|MOD_ON)\s*:\s*([01])").unwrap()
});
static RE_BRACKET_INT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(MOD|CHG|PRS|PHQ|HVD|ERR|AE)\[(-?\d+)\]").unwrap()
});
static RE_BRACKET_FLOAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(RPS|VIS)\[(-?\d+(?:\.\d+)?)\]").unwrap()
});
static RE_INK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bINK\s*:\s*(FULL|GOOD|LOW|EMPTY)").unwrap()
});
static RE_MAKEUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bMAKEUP\s*:\s*(FULL|GOOD|LOW|EMPTY)").unwrap()
});
// The `regex` crate has no lookaround, so an open-ended "capture until the
// next label" pattern isn't expressible directly. Known status tokens are
// matched explicitly (longest alternatives first so "Not Ready" doesn't
// get cut short by "Ready"); a single-word fallback covers anything else
// without risking swallowing a trailing "Message: ..." field.
static RE_PRINT_STATUS_KNOWN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Print\s*Status\s*:\s*(Not\s+Ready|Ready|Warming\s*Up|Error|Fault|Offline|Paused)").unwrap()
});
static RE_PRINT_STATUS_FALLBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Print\s*Status\s*:\s*([A-Za-z]+)").unwrap());

fn normalize_ws_upper(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase()
}
static RE_MESSAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bMessage\s*:\s*(\S+)").unwrap());
static RE_POWER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bPower\s*:\s*(\d+):(\d+)").unwrap()
});
static RE_STREAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bStream\s*:\s*(\d+):(\d+)").unwrap()
});

/// Parse a `^SU` response (spec §4.2.1, scenario S1).
pub fn parse_su(response: &str) -> SuFields {
    let body = strip_eol(response);
    let mut out = SuFields::default();

    for caps in RE_FLAG.captures_iter(body) {
        let name = caps[1].to_ascii_uppercase();
        let val = &caps[2] == "1";
        match name.as_str() {
            "V300UP" => out.v300up = Some(val),
            "VLT_ON" => out.vlt_on = Some(val),
            "GUT_ON" => out.gut_on = Some(val),
            "MOD_ON" => out.mod_on = Some(val),
            _ => {}
        }
    }

    for caps in RE_BRACKET_INT.captures_iter(body) {
        let name = caps[1].to_ascii_uppercase();
        let raw = &caps[2];
        match name.as_str() {
            "MOD" => out.modulation = raw.parse().ok(),
            "CHG" => out.charge = raw.parse().ok(),
            "PRS" => out.pressure = raw.parse().ok(),
            "PHQ" => out.phase_quality = raw.parse().ok(),
            "HVD" => out.hv_deflection = Some(raw == "1"),
            "ERR" => out.error_active = Some(raw == "1"),
            "AE" => out.allow_errors = Some(raw == "1"),
            _ => {}
        }
    }

    for caps in RE_BRACKET_FLOAT.captures_iter(body) {
        let name = caps[1].to_ascii_uppercase();
        let raw = &caps[2];
        match name.as_str() {
            "RPS" => out.rotations_per_second = raw.parse().ok(),
            "VIS" => out.viscosity = raw.parse().ok(),
            _ => {}
        }
    }

    if let Some(caps) = RE_INK.captures(body) {
        out.ink_level = Some(FluidLevel::parse(&caps[1]));
    }
    if let Some(caps) = RE_MAKEUP.captures(body) {
        out.makeup_level = Some(FluidLevel::parse(&caps[1]));
    }
    if let Some(caps) = RE_PRINT_STATUS_KNOWN.captures(body) {
        out.print_status = Some(normalize_ws_upper(&caps[1]));
    } else if let Some(caps) = RE_PRINT_STATUS_FALLBACK.captures(body) {
        out.print_status = Some(normalize_ws_upper(&caps[1]));
    }
    if let Some(caps) = RE_MESSAGE.captures(body) {
        let name = caps[1].trim();
        out.current_message = if name.eq_ignore_ascii_case("NONE") {
            None
        } else {
            Some(name.to_ascii_uppercase())
        };
    }
    if let Some(caps) = RE_POWER.captures(body) {
        out.power_hours_minutes = Some((caps[1].parse().unwrap_or(0), caps[2].parse().unwrap_or(0)));
    }
    if let Some(caps) = RE_STREAM.captures(body) {
        out.stream_hours_minutes = Some((caps[1].parse().unwrap_or(0), caps[2].parse().unwrap_or(0)));
    }

    out
}

// ---------------------------------------------------------------------
// ^CN — counters
// ---------------------------------------------------------------------

/// `[product, print, custom1, custom2, custom3, custom4]`.
pub type Counters = [u32; 6];

static RE_TERSE_CN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(PC|PrC|C1|C2|C3|C4)\[(\d+)\]").unwrap());
static RE_VERBOSE_CN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(Product\s*Count|Print\s*Count|Counter\s*([1-4]))\s*:\s*(\d+)").unwrap()
});
static RE_ALT_CN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(Product|Print|Custom([1-4]))\s*:\s*(\d+)").unwrap());
static RE_CSV_SIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*$").unwrap()
});

/// Parse `^CN` across the three documented dialects plus a last-resort
/// comma-separated form (spec §4.2.2, scenario S3). Missing slots default
/// to 0; if fewer than two numbers were recovered overall, return `None`.
pub fn parse_cn(response: &str) -> Option<Counters> {
    let body = strip_eol(response);

    // Last resort: six bare comma-separated integers on one line.
    for line in body.lines() {
        if let Some(caps) = RE_CSV_SIX.captures(line.trim()) {
            let mut out = [0u32; 6];
            for i in 0..6 {
                out[i] = caps[i + 1].parse().unwrap_or(0);
            }
            return Some(out);
        }
    }

    let mut out = [0u32; 6];
    let mut found = 0usize;

    for caps in RE_TERSE_CN.captures_iter(body) {
        let tag = caps[1].to_ascii_uppercase();
        let val: u32 = caps[2].parse().unwrap_or(0);
        let idx = match tag.as_str() {
            "PC" => Some(0),
            "PRC" => Some(1),
            "C1" => Some(2),
            "C2" => Some(3),
            "C3" => Some(4),
            "C4" => Some(5),
            _ => None,
        };
        if let Some(idx) = idx {
            out[idx] = val;
            found += 1;
        }
    }

    if found < 2 {
        for caps in RE_VERBOSE_CN.captures_iter(body) {
            let label = caps[1].to_ascii_lowercase();
            let val: u32 = caps[3].parse().unwrap_or(0);
            if label.starts_with("product") {
                out[0] = val;
                found += 1;
            } else if label.starts_with("print") {
                out[1] = val;
                found += 1;
            } else if let Some(n) = caps.get(2) {
                if let Ok(idx) = n.as_str().parse::<usize>() {
                    if (1..=4).contains(&idx) {
                        out[1 + idx] = val;
                        found += 1;
                    }
                }
            }
        }
    }

    if found < 2 {
        for caps in RE_ALT_CN.captures_iter(body) {
            let label = caps[1].to_ascii_lowercase();
            let val: u32 = caps[3].parse().unwrap_or(0);
            if label == "product" {
                out[0] = val;
                found += 1;
            } else if label == "print" {
                out[1] = val;
                found += 1;
            } else if let Some(n) = caps.get(2) {
                if let Ok(idx) = n.as_str().parse::<usize>() {
                    if (1..=4).contains(&idx) {
                        out[1 + idx] = val;
                        found += 1;
                    }
                }
            }
        }
    }

    if found < 2 {
        None
    } else {
        Some(out)
    }
}

// ---------------------------------------------------------------------
// ^LM — message list
// ---------------------------------------------------------------------

const NOISE_MARKERS: &[&str] = &[
    "MOD[", "CHG[", "PRS[", "RPS[", "HVD[", "VIS[", "PHQ[", "ERR[", "V300UP", "VLT_ON", "GUT_ON",
    "MOD_ON", "INK:",
];
const COUNTER_LABELS: &[&str] = &[
    "PC[", "PRC[", "C1[", "C2[", "C3[", "C4[", "PRODUCT COUNT", "PRINT COUNT", "COUNTER 1",
    "COUNTER 2", "COUNTER 3", "COUNTER 4", "CUSTOM1", "CUSTOM2", "CUSTOM3", "CUSTOM4",
];

static RE_LEADING_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+\.\s*").unwrap());
static RE_CURRENT_MARK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s*\(current\)\s*$").unwrap());
static RE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*Messages\s*\(\d+\)\s*:\s*$").unwrap());

fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }
    if trimmed == EOL_SENTINEL {
        return true;
    }
    if trimmed == ">" {
        return true;
    }
    if trimmed.starts_with('^') {
        return true;
    }
    if trimmed.eq_ignore_ascii_case("COMMAND SUCCESSFUL") || trimmed.eq_ignore_ascii_case("COMMAND FAILED") {
        return true;
    }
    if RE_HEADER.is_match(trimmed) {
        return true;
    }
    let upper = trimmed.to_ascii_uppercase();
    if NOISE_MARKERS.iter().any(|m| upper.contains(m)) {
        return true;
    }
    if COUNTER_LABELS.iter().any(|m| upper.contains(m)) {
        return true;
    }
    false
}

/// Parse `^LM` (spec §4.2.3, scenario S2).
pub fn parse_lm(response: &str) -> (Vec<MessageEntry>, Option<String>) {
    let body = strip_eol(response);
    let mut messages = Vec::new();
    let mut current = None;
    let mut next_id = 1u32;

    for raw_line in body.lines() {
        if is_noise_line(raw_line) {
            continue;
        }
        let mut line = raw_line.trim().to_string();

        let id = if let Some(m) = RE_LEADING_NUM.find(&line) {
            let digits: String = m.as_str().chars().take_while(|c| c.is_ascii_digit()).collect();
            let parsed = digits.parse().unwrap_or(next_id);
            line = line[m.end()..].to_string();
            parsed
        } else {
            next_id
        };

        let is_current = RE_CURRENT_MARK.is_match(&line);
        if is_current {
            line = RE_CURRENT_MARK.replace(&line, "").to_string();
        }

        let name = line.trim().to_ascii_uppercase();
        if name.is_empty() {
            continue;
        }

        if is_current {
            current = Some(name.clone());
        }

        messages.push(MessageEntry { id, name });
        next_id = next_id.max(id) + 1;
    }

    (messages, current)
}

// ---------------------------------------------------------------------
// ^TP, ^SD, ^VV
// ---------------------------------------------------------------------

static RE_TEMPS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(-?\d+(?:\.\d+)?)\s*[,; ]\s*(-?\d+(?:\.\d+)?)").unwrap()
});

/// Extract (printhead, electronics) temperatures from a `^TP` response
/// (spec §4.2.4).
pub fn parse_tp(response: &str) -> Option<(f32, f32)> {
    let body = strip_eol(response);
    for line in body.lines() {
        if let Some(caps) = RE_TEMPS.captures(line.trim()) {
            let a: f32 = caps[1].parse().ok()?;
            let b: f32 = caps[2].parse().ok()?;
            return Some((a, b));
        }
    }
    None
}

/// Parse a `^SD` response as an absolute timestamp (spec §4.2.4).
/// Non-printable bytes are trimmed first; accepts a handful of plausible
/// device date/time layouts.
pub fn parse_sd(response: &str) -> Option<DateTime<Utc>> {
    let body = strip_eol(response);
    let cleaned: String = body
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect();
    let cleaned = cleaned.trim();

    const FORMATS: &[&str] = &[
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%m-%d-%Y %H:%M",
    ];
    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, fmt) {
            return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

static RE_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+){1,3})").unwrap());

/// Extract a firmware version string from a `^VV` response (spec §4.2.4).
pub fn parse_vv(response: &str) -> Option<String> {
    let body = strip_eol(response);
    RE_VERSION.captures(body).map(|c| c[1].to_string())
}

// ---------------------------------------------------------------------
// ^QP — print settings query
// ---------------------------------------------------------------------

/// Everything `^QP` can report back into [`crate::model::Settings`]
/// (spec §4.5 `query_print_settings`: "apply any of width/height/delay/
/// rotation/bold/speed/gap/pitch the device returns"). The wire format
/// for this response isn't one of the dialects enumerated in §4.2, so
/// this follows the same lenient labelled-field convention as `^CN`'s
/// verbose dialect — see DESIGN.md.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QpFields {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub delay: Option<u32>,
    pub rotation: Option<Rotation>,
    pub bold: Option<u8>,
    pub speed: Option<Speed>,
    pub gap: Option<u8>,
    pub pitch: Option<u32>,
}

static RE_QP_NUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(Width|Height|Delay|Bold|Gap|Pitch)\s*:\s*(\d+)").unwrap());
// Longest alternatives first: the `regex` crate prefers the first matching
// alternative at a given position, not the longest, so "Tower Mirror Flip"
// must precede "Tower Mirror" must precede "Tower", etc.
static RE_QP_ROTATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bRotation\s*:\s*(Tower\s*Mirror\s*Flip|Tower\s*Mirror|Tower\s*Flip|Tower|Mirror\s*Flip|Mirror|Flip|Normal|\d+)").unwrap()
});
static RE_QP_SPEED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bSpeed\s*:\s*(Ultra\s*Fast|Fastest|Faster|Fast|\d+)").unwrap()
});

fn rotation_from_token(token: &str) -> Option<Rotation> {
    let t = token.trim();
    if let Ok(code) = t.parse::<u8>() {
        return match code {
            0 => Some(Rotation::Normal),
            1 => Some(Rotation::Mirror),
            2 => Some(Rotation::Flip),
            3 => Some(Rotation::MirrorFlip),
            4 => Some(Rotation::Tower),
            5 => Some(Rotation::TowerFlip),
            6 => Some(Rotation::TowerMirror),
            7 => Some(Rotation::TowerMirrorFlip),
            _ => None,
        };
    }
    match t.split_whitespace().collect::<String>().to_ascii_uppercase().as_str() {
        "NORMAL" => Some(Rotation::Normal),
        "MIRROR" => Some(Rotation::Mirror),
        "FLIP" => Some(Rotation::Flip),
        "MIRRORFLIP" => Some(Rotation::MirrorFlip),
        "TOWER" => Some(Rotation::Tower),
        "TOWERFLIP" => Some(Rotation::TowerFlip),
        "TOWERMIRROR" => Some(Rotation::TowerMirror),
        "TOWERMIRRORFLIP" => Some(Rotation::TowerMirrorFlip),
        _ => None,
    }
}

fn speed_from_token(token: &str) -> Option<Speed> {
    let t = token.trim();
    if let Ok(code) = t.parse::<u8>() {
        return match code {
            0 => Some(Speed::Fast),
            1 => Some(Speed::Faster),
            2 => Some(Speed::Fastest),
            3 => Some(Speed::UltraFast),
            _ => None,
        };
    }
    match t.split_whitespace().collect::<String>().to_ascii_uppercase().as_str() {
        "FAST" => Some(Speed::Fast),
        "FASTER" => Some(Speed::Faster),
        "FASTEST" => Some(Speed::Fastest),
        "ULTRAFAST" => Some(Speed::UltraFast),
        _ => None,
    }
}

/// Parse a `^QP` response (spec §4.5 `query_print_settings`).
pub fn parse_qp(response: &str) -> QpFields {
    let body = strip_eol(response);
    let mut out = QpFields::default();

    for caps in RE_QP_NUM.captures_iter(body) {
        let label = caps[1].to_ascii_lowercase();
        let val: u32 = caps[2].parse().unwrap_or(0);
        match label.as_str() {
            "width" => out.width = Some(val),
            "height" => out.height = Some(val),
            "delay" => out.delay = Some(val),
            "bold" => out.bold = Some(val.min(9) as u8),
            "gap" => out.gap = Some(val.min(9) as u8),
            "pitch" => out.pitch = Some(val),
            _ => {}
        }
    }
    if let Some(caps) = RE_QP_ROTATION.captures(body) {
        out.rotation = rotation_from_token(&caps[1]);
    }
    if let Some(caps) = RE_QP_SPEED.captures(body) {
        out.speed = speed_from_token(&caps[1]);
    }

    out
}

/// `^QP` — request the active message's print settings (spec §4.5).
pub fn format_qp() -> String {
    "^QP\r".to_string()
}

// ---------------------------------------------------------------------
// Command formatters (spec §4.2.5)
// ---------------------------------------------------------------------

/// `^PR 0|1` — HV off/on. `compact` selects the `^PR1` encoding that some
/// firmware revisions require as a fallback (spec §9 open question: try
/// compact only if spaced fails).
pub fn format_pr(on: bool, compact: bool) -> String {
    let v = if on { 1 } else { 0 };
    if compact {
        format!("^PR{}\r", v)
    } else {
        format!("^PR {}\r", v)
    }
}

pub fn format_sj(on: bool) -> String {
    format!("^SJ {}\r", if on { 1 } else { 0 })
}

pub fn format_sm(name: &str) -> String {
    format!("^SM {}\r", name.trim().to_ascii_uppercase())
}

/// Counter id per spec §4.2.5: 0 print, 1-4 custom, 6 product.
pub fn format_cc(counter_id: u8, value: u32) -> crate::errors::Result<String> {
    match counter_id {
        0 | 1 | 2 | 3 | 4 | 6 => Ok(format!("^CC {};{}\r", counter_id, value)),
        other => Err(crate::errors::CoreError::ConfigInvalid(format!(
            "counter id {} out of range",
            other
        ))),
    }
}

pub fn format_pw(n: u32) -> String {
    format!("^PW {}\r", n)
}
pub fn format_ph(n: u32) -> String {
    format!("^PH {}\r", n)
}
pub fn format_da(n: u32) -> String {
    format!("^DA {}\r", n)
}
pub fn format_sb(n: u8) -> crate::errors::Result<String> {
    if n > 9 {
        return Err(crate::errors::CoreError::ConfigInvalid(format!("bold {} out of range 0-9", n)));
    }
    Ok(format!("^SB {}\r", n))
}
pub fn format_gp(n: u8) -> crate::errors::Result<String> {
    if n > 9 {
        return Err(crate::errors::CoreError::ConfigInvalid(format!("gap {} out of range 0-9", n)));
    }
    Ok(format!("^GP {}\r", n))
}
pub fn format_pa(n: u32) -> String {
    format!("^PA {}\r", n)
}
pub fn format_ra(n: u32) -> String {
    format!("^RA {}\r", n)
}

fn speed_code(speed: Speed) -> u8 {
    match speed {
        Speed::Fast => 0,
        Speed::Faster => 1,
        Speed::Fastest => 2,
        Speed::UltraFast => 3,
    }
}

fn rotation_code(rotation: Rotation) -> u8 {
    match rotation {
        Rotation::Normal => 0,
        Rotation::Mirror => 1,
        Rotation::Flip => 2,
        Rotation::MirrorFlip => 3,
        Rotation::Tower => 4,
        Rotation::TowerFlip => 5,
        Rotation::TowerMirror => 6,
        Rotation::TowerMirrorFlip => 7,
    }
}

fn print_mode_code(mode: PrintMode) -> u8 {
    match mode {
        PrintMode::Normal => 0,
        PrintMode::Auto => 1,
        PrintMode::Repeat => 2,
        PrintMode::Reverse => 3,
    }
}

/// `^CM s<0-3>;o<0-7>;p<0-3>` — per-message persistent settings.
pub fn format_cm(speed: Speed, rotation: Rotation, print_mode: PrintMode) -> String {
    format!(
        "^CM s{};o{};p{}\r",
        speed_code(speed),
        rotation_code(rotation),
        print_mode_code(print_mode)
    )
}

pub fn format_dm(name: &str) -> String {
    format!("^DM {}\r", name.trim().to_ascii_uppercase())
}

pub fn format_lg(password: &str) -> String {
    format!("^LG {}\r", password)
}

pub fn format_lo() -> String {
    "^LO\r".to_string()
}

// ---------------------------------------------------------------------
// ^NM message composer (spec §4.2.5)
// ---------------------------------------------------------------------

/// Font selection → device code (exact integers per spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Font {
    Standard5High,
    Standard7High,
    Standard12High,
    Standard16High,
    Standard24High,
    Standard34High,
}

fn font_code(font: Font) -> u32 {
    match font {
        Font::Standard5High => 0,
        Font::Standard7High => 2,
        Font::Standard12High => 3,
        Font::Standard16High => 4,
        Font::Standard24High => 5,
        Font::Standard34High => 6,
    }
}

/// A single field within a composed message (spec §4.2.5).
#[derive(Debug, Clone)]
pub enum MessageField {
    Text { x: i32, y: i32, font: Font, data: String },
    UserDefine { x: i32, y: i32, font: Font, data: String },
    Date { x: i32, y: i32, size: u32 },
    Time { x: i32, y: i32, size: u32 },
    Counter { x: i32, y: i32, size: u32 },
    Barcode { x: i32, y: i32, size: u32, data: String },
    Logo { x: i32, y: i32, name: String },
}

impl MessageField {
    fn y(&self) -> i32 {
        match self {
            MessageField::Text { y, .. }
            | MessageField::UserDefine { y, .. }
            | MessageField::Date { y, .. }
            | MessageField::Time { y, .. }
            | MessageField::Counter { y, .. }
            | MessageField::Barcode { y, .. }
            | MessageField::Logo { y, .. } => *y,
        }
    }

    /// Emit this field's `^AT`/`^AD`/`^AH`/`^AC`/`^AB`/`^AL` subcommand.
    /// `remapped_y` is the already template-offset y coordinate.
    fn emit(&self, field_index: u32, remapped_y: i32) -> String {
        match self {
            MessageField::Text { x, font, data, .. } => {
                format!("^AT{};{};{};{};{}", field_index, x, remapped_y, font_code(*font), data)
            }
            MessageField::UserDefine { x, font, data, .. } => {
                format!("^AT{};{};{};{};{}", field_index, x, remapped_y, font_code(*font), data)
            }
            MessageField::Date { x, size, .. } => {
                format!("^AD{};{};{};{};12", field_index, x, remapped_y, size)
            }
            MessageField::Time { x, size, .. } => {
                format!("^AH{};{};{};{};7", field_index, x, remapped_y, size)
            }
            MessageField::Counter { x, size, .. } => {
                format!("^AC{};{};{};{};0", field_index, x, remapped_y, size)
            }
            MessageField::Barcode { x, size, data, .. } => {
                format!("^AB{};{};{};{};6;0;1;{}", field_index, x, remapped_y, size, data)
            }
            MessageField::Logo { x, name, .. } => {
                format!("^AL{};{};{};{}", field_index, x, remapped_y, name)
            }
        }
    }
}

/// Coordinates are template-relative: subtract `(32 - template_height)`
/// from each field's y before emitting (spec §4.2.5, scenario S4).
pub fn template_y_offset(template_height: u32) -> i32 {
    32 - template_height as i32
}

/// Print-head resolution/height selection (glossary: "Template"). The
/// spec calls for an exact "Template → code map" but does not enumerate
/// one — `code` defaults to 0 (the only value the spec's own examples
/// ever show), while `height` is what drives the y-coordinate remap.
/// See DESIGN.md for this as a recorded Open Question.
#[derive(Debug, Clone, Copy)]
pub struct Template {
    pub code: u32,
    pub height: u32,
}

impl Template {
    pub const fn new(height: u32) -> Self {
        Self { code: 0, height }
    }
}

/// Compose a full `^NM` message from fields (spec §4.2.5).
///
/// `t`, `s`, `o`, `p` are the message-level template/speed/orientation/
/// print-mode codes threaded through the leading `^NM` header, in that
/// order, matching the wire layout `^NM t;s;o;p;<name>`.
pub fn format_nm(
    name: &str,
    template: Template,
    speed: Speed,
    rotation: Rotation,
    print_mode: PrintMode,
    fields: &[MessageField],
) -> String {
    let offset = template_y_offset(template.height);
    let mut out = format!(
        "^NM {};{};{};{};{}",
        template.code,
        speed_code(speed),
        rotation_code(rotation),
        print_mode_code(print_mode),
        name.trim().to_ascii_uppercase()
    );
    for (i, field) in fields.iter().enumerate() {
        let remapped_y = field.y() - offset;
        out.push_str(&field.emit((i + 1) as u32, remapped_y));
    }
    out.push('\r');
    out
}

/// The minimal `^NM` emitted by `create_message_on_printer` (spec §4.5) so
/// the device registers a name before any content is saved to it. Lifted
/// verbatim from the spec's own example rather than built from
/// [`MessageField`] — the placeholder font code (7) it uses doesn't
/// correspond to any of the named fonts used by [`format_nm`].
pub fn format_nm_minimal(name: &str) -> String {
    format!("^NM 0;0;0;0;{}^AT1;0;0;7; \r", name.trim().to_ascii_uppercase())
}
