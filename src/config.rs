use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// A printer as known to the HMI — created and owned externally (spec §3),
/// passed into the core by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterIdentity {
    pub id: u32,
    pub name: String,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl PrinterIdentity {
    pub fn new(id: u32, name: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            id,
            name: name.into(),
            address,
            port: DEFAULT_PORT,
        }
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from((self.address, self.port))
    }
}

/// Default BestCode Remote Protocol TCP port (spec §6).
pub const DEFAULT_PORT: u16 = 23;

/// Process-wide timing/sizing constants (spec §6), read once at start and
/// shared behind an `Arc` by every component. All fields are overridable at
/// runtime — the HMI shell may adjust them, e.g. from an operator settings
/// screen — which is why this is a plain struct rather than a set of
/// `const`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub availability_interval_ms: u64,
    pub offline_threshold: u32,
    pub polling_interval_ms: u64,
    pub clock_polling_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub post_connect_settle_ms: u64,
    pub probe_inter_gap_ms: u64,
    pub command_log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            availability_interval_ms: 5_000,
            offline_threshold: 5,
            polling_interval_ms: 3_000,
            clock_polling_interval_ms: 5_000,
            command_timeout_ms: 8_000,
            post_connect_settle_ms: 1_000,
            probe_inter_gap_ms: 800,
            command_log_capacity: 1_000,
        }
    }
}

impl Config {
    /// Build from defaults overlaid with any `BESTCODE_*` environment
    /// variables present in the process environment. Unparseable values are
    /// ignored and the default is kept — a malformed override must not
    /// crash the HMI at startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        macro_rules! overlay {
            ($field:ident, $env:literal) => {
                if let Ok(raw) = std::env::var($env) {
                    if let Ok(parsed) = raw.parse() {
                        cfg.$field = parsed;
                    }
                }
            };
        }
        overlay!(availability_interval_ms, "BESTCODE_AVAILABILITY_INTERVAL_MS");
        overlay!(offline_threshold, "BESTCODE_OFFLINE_THRESHOLD");
        overlay!(polling_interval_ms, "BESTCODE_POLLING_INTERVAL_MS");
        overlay!(clock_polling_interval_ms, "BESTCODE_CLOCK_POLLING_INTERVAL_MS");
        overlay!(command_timeout_ms, "BESTCODE_COMMAND_TIMEOUT_MS");
        overlay!(post_connect_settle_ms, "BESTCODE_POST_CONNECT_SETTLE_MS");
        overlay!(probe_inter_gap_ms, "BESTCODE_PROBE_INTER_GAP_MS");
        overlay!(command_log_capacity, "BESTCODE_COMMAND_LOG_CAPACITY");
        cfg
    }

    pub fn availability_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.availability_interval_ms)
    }
    pub fn polling_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.polling_interval_ms)
    }
    pub fn clock_polling_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.clock_polling_interval_ms)
    }
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.command_timeout_ms)
    }
    pub fn post_connect_settle(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.post_connect_settle_ms)
    }
    pub fn probe_inter_gap(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.probe_inter_gap_ms)
    }
}
