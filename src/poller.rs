//! Serialized Poller (spec §4.4): the fixed-order background refresh of
//! the connected printer's live state. "Serialized" means exactly one
//! command is ever in flight against the connected printer's transport
//! at a time — the poller and any foreground command share the same
//! underlying session mutex inside `Transport`, but the poller itself
//! also never starts command *N+1* of its own cycle before command *N*'s
//! response has been read.

use crate::codec;
use crate::config::Config;
use crate::model::{CommandLog, LogDirection, Status};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// Per-cycle outcome, folded into the connected printer's live state by
/// the Connection Manager.
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub su: Option<codec::SuFields>,
    pub messages: Option<(Vec<crate::model::MessageEntry>, Option<String>)>,
    pub counters: Option<codec::Counters>,
    pub temps: Option<(f32, f32)>,
    pub clock: Option<chrono::DateTime<chrono::Utc>>,
    /// True when this tick's key command (the full cycle's `^SU`, or the
    /// clock-only cycle's `^SD`) failed at the transport level. This, not
    /// `su.is_none()`, is the signal `ConnectionManager` counts toward its
    /// three-consecutive-failure auto-disconnect (spec §4.5) — a `^SU`
    /// that parses to nothing is "no change", not a failure (spec §4.5),
    /// and a clock-only tick legitimately never attempts `^SU` at all.
    pub tick_failed: bool,
}

/// Drives the `[^SU, ^LM, ^CN, ^TP, ^SD]` cycle, or a clock-only `^SD`
/// cycle when neither screen that needs live data is open (spec §4.4).
pub struct SerializedPoller {
    config: Arc<Config>,
    /// Swapped in by the Connection Manager on `connect`/`disconnect`
    /// ("hands that Transport to Serialized Poller", spec §2). `None`
    /// means no connected session; the poller idles.
    transport: AsyncMutex<Option<Arc<dyn Transport>>>,
    log: Arc<CommandLog>,
    dashboard_open: AtomicBool,
    service_open: AtomicBool,
    connected: AtomicBool,
    results: watch::Sender<PollResult>,
}

impl SerializedPoller {
    pub fn new(config: Arc<Config>, log: Arc<CommandLog>) -> Self {
        let (tx, _rx) = watch::channel(PollResult::default());
        Self {
            config,
            transport: AsyncMutex::new(None),
            log,
            dashboard_open: AtomicBool::new(false),
            service_open: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            results: tx,
        }
    }

    /// Hand the poller a fresh connected-session transport, or clear it on
    /// disconnect. The current tick (if any) finishes with whatever
    /// transport it already captured; this only affects the next one.
    pub async fn set_transport(&self, transport: Option<Arc<dyn Transport>>) {
        *self.transport.lock().await = transport;
    }

    pub fn subscribe(&self) -> watch::Receiver<PollResult> {
        self.results.subscribe()
    }

    pub fn set_dashboard_open(&self, open: bool) {
        self.dashboard_open.store(open, Ordering::SeqCst);
    }

    pub fn set_service_open(&self, open: bool) {
        self.service_open.store(open, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn screens_open(&self) -> bool {
        self.dashboard_open.load(Ordering::SeqCst) || self.service_open.load(Ordering::SeqCst)
    }

    /// Active iff connected and at least one of the two screens that
    /// consumes live data is open (spec §4.4).
    pub fn is_full_cycle_active(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.screens_open()
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if !self.connected.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            }

            if self.screens_open() {
                tokio::time::sleep(self.config.polling_interval()).await;
                if self.connected.load(Ordering::SeqCst) && self.screens_open() {
                    self.run_full_cycle().await;
                }
            } else {
                tokio::time::sleep(self.config.clock_polling_interval()).await;
                if self.connected.load(Ordering::SeqCst) && !self.screens_open() {
                    self.run_clock_only().await;
                }
            }
        }
    }

    async fn send_logged(&self, command: &str) -> crate::errors::Result<String> {
        let transport = self.transport.lock().await.clone();
        let Some(transport) = transport else {
            return Err(crate::errors::CoreError::NotConnected);
        };
        let outcome = transport.send_command(command).await;
        self.log.push(LogDirection::Sent, command.trim_end().to_string(), None);
        if outcome.success {
            self.log.push(LogDirection::Received, command.trim_end().to_string(), Some(outcome.response_text.clone()));
            Ok(outcome.response_text)
        } else {
            let err = outcome.error.unwrap_or_else(|| "unknown transport failure".to_string());
            warn!(command = command.trim_end(), error = %err, "poller command failed");
            Err(crate::errors::CoreError::TransportBroken(err))
        }
    }

    /// One full `[^SU, ^LM, ^CN, ^TP, ^SD]` pass, strictly ordered. A
    /// failure partway through still yields whatever fields were
    /// recovered before it (spec §4.4: partial cycles are valid).
    async fn run_full_cycle(&self) {
        let mut result = PollResult::default();

        match self.send_logged("^SU").await {
            Ok(text) => result.su = Some(codec::parse_su(&text)),
            Err(_) => result.tick_failed = true,
        }
        if let Ok(text) = self.send_logged("^LM").await {
            result.messages = Some(codec::parse_lm(&text));
        }
        if let Ok(text) = self.send_logged("^CN").await {
            result.counters = codec::parse_cn(&text);
        }
        if let Ok(text) = self.send_logged("^TP").await {
            result.temps = codec::parse_tp(&text);
        }
        if let Ok(text) = self.send_logged("^SD").await {
            result.clock = codec::parse_sd(&text);
        }

        debug!("poll cycle complete");
        let _ = self.results.send(result);
    }

    /// Reduced cycle: only the device clock, kept alive so the
    /// connection doesn't go fully idle while no screen needs live data
    /// (spec §4.4). Builds a fresh result rather than carrying forward the
    /// previous cycle's `su`/`messages`/`counters` — those are legitimately
    /// absent on a clock-only tick, not stale values to keep re-publishing.
    async fn run_clock_only(&self) {
        let mut result = PollResult::default();
        match self.send_logged("^SD").await {
            Ok(text) => result.clock = codec::parse_sd(&text),
            Err(_) => result.tick_failed = true,
        }
        let _ = self.results.send(result);
    }
}

use std::time::Duration;

pub(crate) fn fold_status(status: &mut Status, result: &PollResult) {
    if let Some(su) = &result.su {
        if let Some(ink) = su.ink_level {
            status.ink_level = ink;
        }
        if let Some(makeup) = su.makeup_level {
            status.makeup_level = makeup;
        }
        if let Some(msg) = &su.current_message {
            status.current_message = Some(msg.clone());
        }
    }
    if let Some(counters) = result.counters {
        status.product_count = counters[0];
        status.print_count = counters[1];
        status.custom_counts = [counters[2], counters[3], counters[4], counters[5]];
    }
    if let Some(clock) = result.clock {
        status.device_clock = Some(clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CommandOutcome, SessionState};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeTransport {
        responses: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn set_meta(&self, _identity: crate::config::PrinterIdentity) {}
        async fn connect(&self) -> crate::errors::Result<()> {
            Ok(())
        }
        async fn send_command(&self, _command: &str) -> CommandOutcome {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return CommandOutcome { success: false, response_text: String::new(), error: Some("exhausted".into()) };
            }
            CommandOutcome { success: true, response_text: responses.remove(0), error: None }
        }
        async fn disconnect(&self) {}
        fn state(&self) -> SessionState {
            SessionState::Open
        }
    }

    #[tokio::test]
    async fn full_cycle_sends_commands_in_spec_order_and_parses_each() {
        let fake = Arc::new(FakeTransport {
            responses: StdMutex::new(vec![
                "Print Status: Ready\r\n//EOL\r\n".to_string(),
                "Messages (1):\r\n1. BESTCODE\r\n//EOL\r\n".to_string(),
                "308,7,10,21,34,45\r\n//EOL\r\n".to_string(),
                "28.5,31.2\r\n//EOL\r\n".to_string(),
                "01/15/2026 14:30:00\r\n//EOL\r\n".to_string(),
            ]),
        });
        let log = Arc::new(CommandLog::new(10));
        let poller = SerializedPoller::new(Arc::new(Config::default()), log.clone());
        poller.set_transport(Some(fake)).await;
        poller.run_full_cycle().await;

        let result = poller.results.borrow().clone();
        assert!(result.su.unwrap().is_ready());
        assert_eq!(result.messages.unwrap().0.len(), 1);
        assert_eq!(result.counters.unwrap(), [308, 7, 10, 21, 34, 45]);
        assert_eq!(result.temps, Some((28.5, 31.2)));
        assert!(result.clock.is_some());

        // 5 commands sent + 5 responses received = 10 log entries.
        assert_eq!(log.snapshot().len(), 10);
    }

    #[tokio::test]
    async fn full_cycle_with_no_transport_yields_empty_result() {
        let log = Arc::new(CommandLog::new(10));
        let poller = SerializedPoller::new(Arc::new(Config::default()), log.clone());
        poller.run_full_cycle().await;
        let result = poller.results.borrow().clone();
        assert!(result.su.is_none());
        assert!(result.tick_failed, "no transport must count as a failed tick");
        assert!(log.snapshot().is_empty());
    }

    #[tokio::test]
    async fn clock_only_cycle_does_not_carry_forward_stale_fields() {
        let fake = Arc::new(FakeTransport {
            responses: StdMutex::new(vec![
                "Print Status: Ready\r\n//EOL\r\n".to_string(),
                "Messages (0):\r\n//EOL\r\n".to_string(),
                "0,0,0,0,0,0\r\n//EOL\r\n".to_string(),
                "28.0,30.0\r\n//EOL\r\n".to_string(),
                "01/15/2026 14:30:00\r\n//EOL\r\n".to_string(),
                "01/15/2026 14:31:00\r\n//EOL\r\n".to_string(),
            ]),
        });
        let log = Arc::new(CommandLog::new(10));
        let poller = SerializedPoller::new(Arc::new(Config::default()), log.clone());
        poller.set_transport(Some(fake)).await;

        // A prior full cycle leaves `su` populated...
        poller.run_full_cycle().await;
        assert!(poller.results.borrow().su.is_some());

        // ...but a subsequent clock-only tick must not keep republishing
        // that stale `su`, only its own fresh `clock` value.
        poller.run_clock_only().await;
        let result = poller.results.borrow().clone();
        assert!(result.su.is_none(), "clock-only tick must not carry forward a stale ^SU");
        assert!(result.clock.is_some());
        assert!(!result.tick_failed);
    }

    #[tokio::test]
    async fn clock_only_failure_is_flagged_without_a_stale_su() {
        let log = Arc::new(CommandLog::new(10));
        let poller = SerializedPoller::new(Arc::new(Config::default()), log.clone());
        poller.run_clock_only().await;
        let result = poller.results.borrow().clone();
        assert!(result.su.is_none());
        assert!(result.tick_failed, "a failed ^SD send on a clock-only tick must still count as a failure");
    }
}
