//! Connection Manager (spec §4.5): the orchestrator. Owns the single
//! "connected printer" identity, the mirrored state, the lazy socket
//! lifecycle, the initial handshake burst, and the fan-out of parsed
//! updates to subscribers. Every other component (Transport, Codec,
//! Serialized Poller) is a collaborator this module drives; the
//! Availability Supervisor is a sibling that shares only the
//! `connected_id` cell so it knows which identity to exclude.

use crate::codec::{self, MessageField, Template};
use crate::config::{Config, PrinterIdentity};
use crate::directory::{MirrorPatch, PrinterDirectory};
use crate::errors::{CoreError, Result};
use crate::model::{
    CommandLog, CommandLogEntry, ConnectedState, LogDirection, MessageEntry, PrintMode,
    PrinterMirror, ReadyState, Rotation, Settings, Speed, Status,
};
use crate::poller::{self, PollResult, SerializedPoller};
use crate::transport::{SessionState, Transport};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

/// How a fresh `Transport` is produced for a connect (real socket in
/// production, a fake in tests — spec §9: "Transport selection ... is a
/// runtime strategy behind a single Transport capability").
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// Number of consecutive poll cycles whose `^SU` step must fail before the
/// manager auto-disconnects (spec §4.5 Failure semantics).
const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

/// How long `disconnect()` waits before actually closing the socket, so
/// an in-flight poll command gets to finish its read (spec §4.4: "closing
/// ... waits ≈2s before issuing disconnect, giving in-flight polling
/// commands time to drain" — applied here to the full disconnect rather
/// than to screen toggling; see DESIGN.md).
const DISCONNECT_LINGER: Duration = Duration::from_millis(2000);

const PR_CONFIRM_DELAY: Duration = Duration::from_millis(800);
const SJ_CONFIRM_DELAY: Duration = Duration::from_millis(1500);
const CN_CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// Broadcast event fed to subscribers (spec §9: "callback subscriptions
/// map onto a broadcast channel of immutable snapshots; no reader may
/// mutate shared state").
#[derive(Debug, Clone)]
pub enum CoreEvent {
    Mirror(PrinterMirror),
    Connection(ConnectionSnapshot),
    Log(CommandLogEntry),
}

/// A read-only view of the current connection, or an empty snapshot when
/// nothing is connected.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSnapshot {
    pub identity_id: Option<u32>,
    pub status: Option<Status>,
    pub metrics: Option<crate::model::Metrics>,
    pub settings: Option<Settings>,
    pub messages: Vec<MessageEntry>,
    pub socket_ready: bool,
}

/// The seven fields `save_global_adjust` sends (spec §4.2.5/§4.5):
/// `^PW`, `^PH`, `^DA`, `^SB`, `^GP`, `^PA`, `^RA` in that order.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAdjust {
    pub width: u32,
    pub height: u32,
    pub delay: u32,
    pub bold: u8,
    pub gap: u8,
    pub pitch: u32,
    pub repeat_amount: u32,
}

pub struct ConnectionManager {
    config: Arc<Config>,
    directory: Arc<dyn PrinterDirectory>,
    transport_factory: TransportFactory,
    /// Shared with `AvailabilitySupervisor` so the sweep can exclude this
    /// identity (spec §3 invariant c, §4.3).
    connected_id: Arc<StdMutex<Option<u32>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    state: Mutex<Option<ConnectedState>>,
    poller: Arc<SerializedPoller>,
    log: Arc<CommandLog>,
    events: broadcast::Sender<CoreEvent>,
    consecutive_poll_failures: AtomicU32,
    signed_in: AtomicBool,
    /// Local fallback password for `^LG`, configured by the HMI shell
    /// (spec §9 open question: sign-in may be locally gated when the
    /// device rejects `^LG`).
    local_password: Option<String>,
    /// Lets `&self` methods obtain an owned `Arc<Self>` to move into a
    /// spawned task, without forcing every caller to pass one in.
    self_weak: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<Config>,
        directory: Arc<dyn PrinterDirectory>,
        transport_factory: TransportFactory,
        connected_id: Arc<StdMutex<Option<u32>>>,
        local_password: Option<String>,
    ) -> Arc<Self> {
        let log = Arc::new(CommandLog::new(config.command_log_capacity));
        let poller = Arc::new(SerializedPoller::new(config.clone(), log.clone()));
        let (events, _rx) = broadcast::channel(256);

        let manager = Arc::new_cyclic(|weak| Self {
            config,
            directory,
            transport_factory,
            connected_id,
            transport: Mutex::new(None),
            state: Mutex::new(None),
            poller,
            log,
            events,
            consecutive_poll_failures: AtomicU32::new(0),
            signed_in: AtomicBool::new(false),
            local_password,
            self_weak: weak.clone(),
        });

        tokio::spawn(Arc::clone(&manager).run_poll_result_watcher());
        manager
    }

    /// Obtains an owned `Arc<Self>` from a `&self` method, for handing to
    /// a spawned task that must outlive the current call.
    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("connection manager dropped while still in use")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn poller(&self) -> Arc<SerializedPoller> {
        self.poller.clone()
    }

    pub fn command_log(&self) -> Arc<CommandLog> {
        self.log.clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::SeqCst)
    }

    pub fn set_dashboard_open(&self, open: bool) {
        self.poller.set_dashboard_open(open);
    }

    pub fn set_service_open(&self, open: bool) {
        self.poller.set_service_open(open);
    }

    pub async fn connection_snapshot(&self) -> ConnectionSnapshot {
        self.build_snapshot().await
    }

    async fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().await.clone()
    }

    // -----------------------------------------------------------------
    // Connect / disconnect
    // -----------------------------------------------------------------

    /// spec §4.5: "disconnect any previous connection first. Register
    /// transport meta (no socket). Seed a fresh ConnectedState ... The
    /// operation itself returns before the burst completes."
    #[instrument(skip(self))]
    pub async fn connect(&self, identity: PrinterIdentity) -> Result<()> {
        self.teardown(false).await;

        let transport = (self.transport_factory)();
        transport.set_meta(identity.clone()).await;

        *self.transport.lock().await = Some(transport.clone());
        *self.connected_id.lock().unwrap() = Some(identity.id);
        *self.state.lock().await = Some(ConnectedState::new(identity.id));
        self.consecutive_poll_failures.store(0, Ordering::SeqCst);

        self.directory.update_status(
            identity.id,
            MirrorPatch {
                available: Some(true),
                ready_state: Some(ReadyState::NotReady),
                ..Default::default()
            },
        );

        self.poller.set_transport(Some(transport)).await;
        self.poller.set_connected(true);
        self.publish_connection_snapshot().await;

        let this = self.arc_self();
        tokio::spawn(async move { this.run_initial_burst().await });

        info!(printer_id = identity.id, "connect requested, initial burst scheduled");
        Ok(())
    }

    /// User-invoked disconnect (spec §4.5): "close transport, clear
    /// socket_ready, remove ConnectedState, mark the identity ¬connected
    /// in the mirror. Does not touch availability."
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.teardown(true).await;
    }

    /// Shared teardown for both the explicit `disconnect()` operation and
    /// the implicit "disconnect any previous connection first" step of
    /// `connect()`. `graceful` selects the linger described in spec §4.4.
    async fn teardown(&self, graceful: bool) {
        let id = self.connected_id.lock().unwrap().take();
        let Some(id) = id else { return };

        self.poller.set_connected(false);

        if graceful {
            tokio::time::sleep(DISCONNECT_LINGER).await;
        }

        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        self.poller.set_transport(None).await;
        *self.state.lock().await = None;
        self.consecutive_poll_failures.store(0, Ordering::SeqCst);

        // "Does not touch availability" — only ready_state is reset, the
        // `available` flag is left as the Availability Supervisor last
        // set it.
        self.directory.update_status(
            id,
            MirrorPatch { ready_state: Some(ReadyState::NotReady), ..Default::default() },
        );
        self.publish_connection_snapshot().await;
        debug!(printer_id = id, graceful, "connection torn down");
    }

    /// Auto-disconnect path (spec §4.5): no linger, the session is
    /// already considered unusable.
    async fn auto_disconnect(&self, reason: &str) {
        warn!(reason, "auto-disconnecting");
        self.teardown(false).await;
    }

    // -----------------------------------------------------------------
    // Initial burst (spec §4.5)
    // -----------------------------------------------------------------

    async fn run_initial_burst(self: Arc<Self>) {
        let Some(transport) = self.current_transport().await else { return };

        if let Err(e) = transport.connect().await {
            warn!(error = %e, "initial burst: transport open failed");
        }

        if let Ok(text) = self.send_and_log(&transport, "^SU").await {
            let fields = codec::parse_su(&text);
            self.apply_su(&fields).await;
        }

        if let Ok(text) = self.send_and_log(&transport, "^LM").await {
            let (messages, current) = codec::parse_lm(&text);
            self.apply_lm(messages, current).await;
        }

        let need_sm = {
            let guard = self.state.lock().await;
            guard.as_ref().map(|s| s.status.current_message.is_none()).unwrap_or(false)
        };
        if need_sm {
            if let Ok(text) = self.send_and_log(&transport, "^SM").await {
                if let Some(name) = last_non_noise_line(&text) {
                    self.apply_current_message(name).await;
                }
            }
        }

        if let Ok(text) = self.send_and_log(&transport, "^CN").await {
            if let Some(counters) = codec::parse_cn(&text) {
                self.apply_counters(counters).await;
            }
        }

        if let Ok(text) = self.send_and_log(&transport, "^VV").await {
            if let Some(version) = codec::parse_vv(&text) {
                self.apply_firmware(version).await;
            }
        }

        if let Ok(text) = self.send_and_log(&transport, "^SD").await {
            if let Some(clock) = codec::parse_sd(&text) {
                self.apply_clock(clock).await;
            }
        }

        info!("initial burst complete");
    }

    // -----------------------------------------------------------------
    // Poller result folding (spec §2, §4.4, §4.5)
    // -----------------------------------------------------------------

    async fn run_poll_result_watcher(self: Arc<Self>) {
        let mut rx = self.poller.subscribe();
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            if self.connected_id.lock().unwrap().is_none() {
                continue;
            }
            let result = rx.borrow().clone();
            self.fold_poll_result(&result).await;
        }
    }

    async fn fold_poll_result(&self, result: &PollResult) {
        let id = {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else { return };
            poller::fold_status(&mut state.status, result);
            if let Some(su) = &result.su {
                apply_su_fields(state, su);
            }
            if let Some((messages, current)) = &result.messages {
                if !messages.is_empty() {
                    state.messages.replace_all(messages.clone());
                }
                if let Some(cur) = current {
                    state.status.current_message = Some(cur.clone());
                }
            }
            if let Some((head, electronics)) = result.temps {
                state.metrics.printhead_temp = Some(head);
                state.metrics.electronics_temp = Some(electronics);
            }
            state.identity_id
        };

        self.directory.update_status(id, mirror_patch_from_poll(result));

        if result.tick_failed {
            let failures = self.consecutive_poll_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= CONSECUTIVE_FAILURE_LIMIT {
                let this = self.arc_self();
                tokio::spawn(async move {
                    this.auto_disconnect("three consecutive poll failures").await;
                });
            }
        } else {
            self.consecutive_poll_failures.store(0, Ordering::SeqCst);
        }

        self.publish_connection_snapshot().await;
    }

    // -----------------------------------------------------------------
    // Apply helpers shared by the initial burst and confirmations
    // -----------------------------------------------------------------

    async fn apply_su(&self, su: &codec::SuFields) {
        if su.is_empty() {
            // spec §4.5: "^SU that parses to nothing -> treat as no
            // change; keep previous fields; never fabricate READY."
            return;
        }
        let id = {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else { return };
            apply_su_fields(state, su);
            state.identity_id
        };

        let ready_state = if su.error_active == Some(true) {
            ReadyState::Error
        } else if su.is_ready() {
            ReadyState::Ready
        } else {
            ReadyState::NotReady
        };
        self.directory.update_status(
            id,
            MirrorPatch {
                available: Some(true),
                ready_state: Some(ready_state),
                has_active_errors: su.error_active,
                ink_level: su.ink_level,
                makeup_level: su.makeup_level,
                current_message: su.current_message.clone().map(Some),
                ..Default::default()
            },
        );
        self.publish_connection_snapshot().await;
    }

    async fn apply_lm(&self, messages: Vec<MessageEntry>, current: Option<String>) {
        if messages.is_empty() && current.is_none() {
            // spec §8: "^LM response that contains only noise lines
            // leaves messages unchanged."
            return;
        }
        let id = {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else { return };
            if !messages.is_empty() {
                state.messages.replace_all(messages);
            }
            if let Some(cur) = &current {
                state.status.current_message = Some(cur.clone());
            }
            state.identity_id
        };
        if let Some(cur) = current {
            self.directory.update_status(
                id,
                MirrorPatch { current_message: Some(Some(cur)), ..Default::default() },
            );
        }
        self.publish_connection_snapshot().await;
    }

    async fn apply_current_message(&self, name: String) {
        let id = {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else { return };
            state.status.current_message = Some(name.clone());
            state.identity_id
        };
        self.directory.update_status(
            id,
            MirrorPatch { current_message: Some(Some(name)), ..Default::default() },
        );
        self.publish_connection_snapshot().await;
    }

    async fn apply_counters(&self, counters: codec::Counters) {
        {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else { return };
            state.status.product_count = counters[0];
            state.status.print_count = counters[1];
            state.status.custom_counts = [counters[2], counters[3], counters[4], counters[5]];
        }
        self.publish_connection_snapshot().await;
    }

    async fn apply_firmware(&self, version: String) {
        {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else { return };
            state.status.firmware_version = Some(version);
        }
        self.publish_connection_snapshot().await;
    }

    async fn apply_clock(&self, clock: chrono::DateTime<chrono::Utc>) {
        {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else { return };
            state.status.device_clock = Some(clock);
        }
        self.publish_connection_snapshot().await;
    }

    // -----------------------------------------------------------------
    // Transport plumbing
    // -----------------------------------------------------------------

    async fn send_and_log(&self, transport: &Arc<dyn Transport>, command: &str) -> Result<String> {
        let trimmed = command.trim_end().to_string();
        self.log.push(LogDirection::Sent, trimmed.clone(), None);
        let _ = self.events.send(CoreEvent::Log(CommandLogEntry {
            direction: LogDirection::Sent,
            timestamp: chrono::Utc::now(),
            command: trimmed.clone(),
            response: None,
        }));

        let outcome = transport.send_command(command).await;
        if !outcome.success {
            let err = outcome.error.unwrap_or_else(|| "unknown transport failure".to_string());
            warn!(command = %trimmed, error = %err, "command failed");
            return Err(CoreError::TransportBroken(err));
        }

        self.log.push(LogDirection::Received, trimmed.clone(), Some(outcome.response_text.clone()));
        let _ = self.events.send(CoreEvent::Log(CommandLogEntry {
            direction: LogDirection::Received,
            timestamp: chrono::Utc::now(),
            command: trimmed.clone(),
            response: Some(outcome.response_text.clone()),
        }));

        if outcome.response_text.to_ascii_uppercase().contains("COMMAND FAILED") {
            return Err(CoreError::CommandRejected(outcome.response_text));
        }
        Ok(outcome.response_text)
    }

    fn schedule_confirmation(&self, delay: Duration, command: &'static str) {
        let this = self.arc_self();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.run_confirmation(command).await;
        });
    }

    async fn run_confirmation(&self, command: &str) {
        let Some(transport) = self.current_transport().await else { return };
        match self.send_and_log(&transport, command).await {
            Ok(text) => match command {
                "^SU" => self.apply_su(&codec::parse_su(&text)).await,
                "^CN" => {
                    if let Some(counters) = codec::parse_cn(&text) {
                        self.apply_counters(counters).await;
                    }
                }
                _ => {}
            },
            Err(e) => warn!(command, error = %e, "confirmation command failed"),
        }
    }

    async fn build_snapshot(&self) -> ConnectionSnapshot {
        let state_snapshot = {
            let guard = self.state.lock().await;
            guard.as_ref().map(|s| {
                (s.identity_id, s.status.clone(), s.metrics.clone(), s.settings.clone(), s.messages.entries().to_vec())
            })
        };
        let socket_ready = match self.transport.lock().await.as_ref() {
            Some(t) => t.state() == SessionState::Open,
            None => false,
        };
        match state_snapshot {
            Some((identity_id, status, metrics, settings, messages)) => ConnectionSnapshot {
                identity_id: Some(identity_id),
                status: Some(status),
                metrics: Some(metrics),
                settings: Some(settings),
                messages,
                socket_ready,
            },
            None => ConnectionSnapshot::default(),
        }
    }

    async fn publish_connection_snapshot(&self) {
        let snapshot = self.build_snapshot().await;
        let _ = self.events.send(CoreEvent::Connection(snapshot));
    }

    // -----------------------------------------------------------------
    // Public operations (spec §4.5)
    // -----------------------------------------------------------------

    /// `^PR 1`, retrying with the compact `^PR1` encoding if the spaced
    /// form fails (spec §9 open question: try compact only if spaced
    /// fails). Never flips `status.hv_on` directly — a `^SU` confirmation
    /// is scheduled instead (spec §8 property 5).
    pub async fn start_print(&self) -> Result<()> {
        self.send_pr(true).await?;
        self.schedule_confirmation(PR_CONFIRM_DELAY, "^SU");
        Ok(())
    }

    pub async fn stop_print(&self) -> Result<()> {
        self.send_pr(false).await?;
        self.schedule_confirmation(PR_CONFIRM_DELAY, "^SU");
        Ok(())
    }

    async fn send_pr(&self, on: bool) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let spaced = codec::format_pr(on, false);
        if self.send_and_log(&transport, &spaced).await.is_ok() {
            return Ok(());
        }
        let compact = codec::format_pr(on, true);
        self.send_and_log(&transport, &compact).await.map(|_| ())
    }

    pub async fn jet_stop(&self) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let cmd = codec::format_sj(false);
        self.send_and_log(&transport, &cmd).await?;
        self.schedule_confirmation(SJ_CONFIRM_DELAY, "^SU");
        Ok(())
    }

    pub async fn jet_start(&self) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let cmd = codec::format_sj(true);
        self.send_and_log(&transport, &cmd).await?;
        self.schedule_confirmation(SJ_CONFIRM_DELAY, "^SU");
        Ok(())
    }

    pub async fn select_message(&self, name: &str) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let cmd = codec::format_sm(name);
        self.send_and_log(&transport, &cmd).await?;
        let upper = name.trim().to_ascii_uppercase();
        self.apply_current_message(upper).await;
        Ok(())
    }

    /// Appends a message locally (deduplicated by uppercased name) and
    /// registers the name on the device with a minimal `^NM` (spec §4.5,
    /// §8 property 6).
    pub async fn create_message_on_printer(&self, name: &str) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let upper = name.trim().to_ascii_uppercase();

        let already_present = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(CoreError::NotConnected)?;
            if state.messages.contains(&upper) {
                true
            } else {
                let next_id = state.messages.entries().len() as u32 + 1;
                state.messages.insert(next_id, &upper);
                false
            }
        };
        if already_present {
            return Ok(());
        }

        let cmd = codec::format_nm_minimal(&upper);
        self.send_and_log(&transport, &cmd).await?;
        self.publish_connection_snapshot().await;
        Ok(())
    }

    /// Saves full message content (spec §4.2.5, §8 property 7): if not
    /// new, `^DM <name>` is sent first, then exactly one `^NM ...` whose
    /// field y-coordinates are template-remapped.
    pub async fn save_message_content(
        &self,
        name: &str,
        template: Template,
        speed: Speed,
        rotation: Rotation,
        print_mode: PrintMode,
        fields: &[MessageField],
        is_new: bool,
    ) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        if !is_new {
            let dm = codec::format_dm(name);
            self.send_and_log(&transport, &dm).await?;
        }
        let nm = codec::format_nm(name, template, speed, rotation, print_mode, fields);
        self.send_and_log(&transport, &nm).await?;
        Ok(())
    }

    pub async fn delete_message(&self, id: u32) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let name = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(CoreError::NotConnected)?;
            let name = state.messages.entries().iter().find(|m| m.id == id).map(|m| m.name.clone());
            if let Some(name) = &name {
                state.messages.remove(name);
            }
            name
        };
        let Some(name) = name else { return Ok(()) };
        let cmd = codec::format_dm(&name);
        self.send_and_log(&transport, &cmd).await?;
        self.publish_connection_snapshot().await;
        Ok(())
    }

    pub async fn reset_counter(&self, counter_id: u8, value: u32) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let cmd = codec::format_cc(counter_id, value)?;
        self.send_and_log(&transport, &cmd).await?;
        self.schedule_confirmation(CN_CONFIRM_DELAY, "^CN");
        Ok(())
    }

    /// Issues the six counter ids `{0, 1, 2, 3, 4, 6}` in sequence (spec
    /// §4.5); a failure on one id does not abort the remainder.
    pub async fn reset_all_counters(&self) -> Result<()> {
        let mut first_err = None;
        for id in [0u8, 1, 2, 3, 4, 6] {
            if let Err(e) = self.reset_counter(id, 0).await {
                warn!(counter_id = id, error = %e, "reset_all_counters: one counter failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn query_counters(&self) -> Result<codec::Counters> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let text = self.send_and_log(&transport, "^CN").await?;
        let counters = codec::parse_cn(&text).ok_or(CoreError::ParseFailed)?;
        self.apply_counters(counters).await;
        Ok(counters)
    }

    /// Emits the seven global-adjust commands in order; a failed step is
    /// logged and the rest are still attempted (spec §4.5).
    pub async fn save_global_adjust(&self, adjust: GlobalAdjust) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;

        let steps: Vec<Result<String>> = vec![
            Ok(codec::format_pw(adjust.width)),
            Ok(codec::format_ph(adjust.height)),
            Ok(codec::format_da(adjust.delay)),
            codec::format_sb(adjust.bold),
            codec::format_gp(adjust.gap),
            Ok(codec::format_pa(adjust.pitch)),
            Ok(codec::format_ra(adjust.repeat_amount)),
        ];

        let mut first_err = None;
        for step in steps {
            match step {
                Ok(cmd) => {
                    if let Err(e) = self.send_and_log(&transport, &cmd).await {
                        warn!(error = %e, "global adjust step failed");
                        first_err.get_or_insert(e);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "global adjust step rejected before sending");
                    first_err.get_or_insert(e);
                }
            }
        }

        {
            let mut guard = self.state.lock().await;
            if let Some(state) = guard.as_mut() {
                state.settings.width = adjust.width;
                state.settings.height = adjust.height;
                state.settings.delay = adjust.delay;
                state.settings.bold = adjust.bold;
                state.settings.gap = adjust.gap;
                state.settings.pitch = adjust.pitch;
                state.settings.repeat_amount = adjust.repeat_amount;
            }
        }
        self.publish_connection_snapshot().await;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn save_message_settings(&self, speed: Speed, rotation: Rotation, print_mode: PrintMode) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let cmd = codec::format_cm(speed, rotation, print_mode);
        self.send_and_log(&transport, &cmd).await?;
        {
            let mut guard = self.state.lock().await;
            if let Some(state) = guard.as_mut() {
                state.settings.speed = speed;
                state.settings.rotation = rotation;
                state.settings.print_mode = print_mode;
            }
        }
        self.publish_connection_snapshot().await;
        Ok(())
    }

    pub async fn query_print_settings(&self) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let cmd = codec::format_qp();
        let text = self.send_and_log(&transport, &cmd).await?;
        let fields = codec::parse_qp(&text);
        {
            let mut guard = self.state.lock().await;
            if let Some(state) = guard.as_mut() {
                if let Some(v) = fields.width {
                    state.settings.width = v;
                }
                if let Some(v) = fields.height {
                    state.settings.height = v;
                }
                if let Some(v) = fields.delay {
                    state.settings.delay = v;
                }
                if let Some(v) = fields.rotation {
                    state.settings.rotation = v;
                }
                if let Some(v) = fields.bold {
                    state.settings.bold = v;
                }
                if let Some(v) = fields.speed {
                    state.settings.speed = v;
                }
                if let Some(v) = fields.gap {
                    state.settings.gap = v;
                }
                if let Some(v) = fields.pitch {
                    state.settings.pitch = v;
                }
            }
        }
        self.publish_connection_snapshot().await;
        Ok(())
    }

    /// `^LG <password>` with a local fallback (spec §9 open question):
    /// if the device rejects the command, accept the literal password
    /// configured by the HMI shell instead.
    pub async fn sign_in(&self, password: &str) -> Result<()> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        let cmd = codec::format_lg(password);
        match self.send_and_log(&transport, &cmd).await {
            Ok(_) => {
                self.signed_in.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(CoreError::CommandRejected(_)) => {
                if self.local_password.as_deref() == Some(password) {
                    self.signed_in.store(true, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(CoreError::AuthFailed)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// `^LO`: the device rejecting sign-out must still clear the HMI's
    /// elevated privilege locally (spec §9 open question).
    pub async fn sign_out(&self) -> Result<()> {
        self.signed_in.store(false, Ordering::SeqCst);
        let Some(transport) = self.current_transport().await else { return Ok(()) };
        let cmd = codec::format_lo();
        match self.send_and_log(&transport, &cmd).await {
            Ok(_) | Err(CoreError::CommandRejected(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Free-form passthrough for a terminal-style UI (spec §4.5).
    pub async fn send_command(&self, raw: &str) -> Result<String> {
        let transport = self.current_transport().await.ok_or(CoreError::NotConnected)?;
        self.send_and_log(&transport, raw).await
    }

    /// Opens an ephemeral transport (independent of any connected
    /// session's transport), issues `^SU` then `^SD`, and closes it
    /// (spec §4.5).
    pub async fn query_printer_metrics(
        &self,
        identity: &PrinterIdentity,
    ) -> Result<(codec::SuFields, Option<chrono::DateTime<chrono::Utc>>)> {
        let transport = (self.transport_factory)();
        transport.set_meta(identity.clone()).await;
        transport.connect().await?;

        let su_outcome = transport.send_command("^SU").await;
        if !su_outcome.success {
            transport.disconnect().await;
            return Err(CoreError::TransportBroken(su_outcome.error.unwrap_or_default()));
        }
        let su = codec::parse_su(&su_outcome.response_text);

        let sd_outcome = transport.send_command("^SD").await;
        let clock = if sd_outcome.success { codec::parse_sd(&sd_outcome.response_text) } else { None };

        transport.disconnect().await;
        Ok((su, clock))
    }
}

/// Folds a parsed `^SU` frame's subsystem flags and telemetry into
/// `ConnectedState`. `hv_on` tracks `VLT_ON` (the high-voltage line) and
/// `jet_running` tracks `MOD_ON` (jet modulation actively driving) — the
/// spec names these as derived display fields without giving the exact
/// flag mapping; see DESIGN.md for this Open Question resolution.
fn apply_su_fields(state: &mut ConnectedState, su: &codec::SuFields) {
    if let Some(v) = su.v300up {
        state.metrics.v300up = v;
    }
    if let Some(v) = su.vlt_on {
        state.metrics.vlt_on = v;
        state.status.hv_on = v;
    }
    if let Some(v) = su.gut_on {
        state.metrics.gut_on = v;
    }
    if let Some(v) = su.mod_on {
        state.metrics.mod_on = v;
        state.status.jet_running = v;
    }
    if let Some(v) = su.modulation {
        state.metrics.modulation = Some(v);
    }
    if let Some(v) = su.charge {
        state.metrics.charge = Some(v);
    }
    if let Some(v) = su.pressure {
        state.metrics.pressure = Some(v);
    }
    if let Some(v) = su.rotations_per_second {
        state.metrics.rotations_per_second = Some(v);
    }
    if let Some(v) = su.phase_quality {
        state.metrics.phase_quality = Some(v);
    }
    if let Some(v) = su.hv_deflection {
        state.metrics.hv_deflection = v;
    }
    if let Some(v) = su.viscosity {
        state.metrics.viscosity = Some(v);
    }
    if let Some(v) = su.error_active {
        state.metrics.error_active = v;
    }
    if let Some(v) = su.allow_errors {
        state.metrics.allow_errors = v;
    }
    if let Some(v) = &su.print_status {
        state.metrics.print_status = Some(v.clone());
    }
    if let Some(v) = su.ink_level {
        state.status.ink_level = v;
    }
    if let Some(v) = su.makeup_level {
        state.status.makeup_level = v;
    }
    if let Some(v) = &su.current_message {
        state.status.current_message = Some(v.clone());
    }
    if let Some(v) = su.power_hours_minutes {
        state.metrics.power_hours_minutes = Some(v);
    }
    if let Some(v) = su.stream_hours_minutes {
        state.metrics.stream_hours_minutes = Some(v);
    }
}

/// Builds the mirror patch for one poll cycle's `^SU` step. Only touches
/// fields the device actually reported; an unparseable `^SU` (`None`)
/// leaves the mirror untouched entirely (spec §4.5, §8).
fn mirror_patch_from_poll(result: &PollResult) -> MirrorPatch {
    let Some(su) = &result.su else {
        return MirrorPatch::default();
    };
    if su.is_empty() {
        return MirrorPatch::default();
    }
    let ready_state = if su.error_active == Some(true) {
        ReadyState::Error
    } else if su.is_ready() {
        ReadyState::Ready
    } else {
        ReadyState::NotReady
    };
    MirrorPatch {
        available: Some(true),
        ready_state: Some(ready_state),
        has_active_errors: su.error_active,
        ink_level: su.ink_level,
        makeup_level: su.makeup_level,
        current_message: su.current_message.clone().map(Some),
        last_print_count: result.counters.map(|c| Some(c[1])),
    }
}

/// Takes the last non-noise line of a response, for the initial burst's
/// `^SM` fallback: "accept the last non-noise line of the reply as the
/// current message" (spec §4.5 step 4).
fn last_non_noise_line(response: &str) -> Option<String> {
    let body = response.trim_end_matches(|c| c == '\r' || c == '\n');
    let body = body.strip_suffix(codec::EOL_SENTINEL).unwrap_or(body);
    body.lines()
        .map(|l| l.trim())
        .filter(|l| {
            !l.is_empty()
                && *l != ">"
                && !l.starts_with('^')
                && !l.eq_ignore_ascii_case("COMMAND SUCCESSFUL")
                && !l.eq_ignore_ascii_case("COMMAND FAILED")
        })
        .next_back()
        .map(|l| l.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::transport::CommandOutcome;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdSyncMutex;

    struct ScriptedTransport {
        queue: StdSyncMutex<VecDeque<CommandOutcome>>,
        sent: StdSyncMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                queue: StdSyncMutex::new(
                    responses
                        .into_iter()
                        .map(|r| CommandOutcome { success: true, response_text: r.to_string(), error: None })
                        .collect(),
                ),
                sent: StdSyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn set_meta(&self, _identity: PrinterIdentity) {}
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn send_command(&self, command: &str) -> CommandOutcome {
            self.sent.lock().unwrap().push(command.trim_end().to_string());
            let mut queue = self.queue.lock().unwrap();
            queue.pop_front().unwrap_or(CommandOutcome {
                success: false,
                response_text: String::new(),
                error: Some("scripted transport exhausted".to_string()),
            })
        }
        async fn disconnect(&self) {}
        fn state(&self) -> SessionState {
            SessionState::Open
        }
    }

    fn test_manager(transport: Arc<ScriptedTransport>) -> Arc<ConnectionManager> {
        let dir: Arc<dyn PrinterDirectory> = Arc::new(InMemoryDirectory::new());
        let identity = PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1));
        dir.add(identity);
        let factory: TransportFactory = Arc::new(move || transport.clone() as Arc<dyn Transport>);
        ConnectionManager::new(
            Arc::new(Config::default()),
            dir,
            factory,
            Arc::new(StdMutex::new(None)),
            Some("fallback-pw".to_string()),
        )
    }

    #[tokio::test]
    async fn connect_seeds_connected_state_and_marks_mirror_available() {
        let transport = ScriptedTransport::new(vec![]);
        let manager = test_manager(transport);
        let identity = PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1));

        manager.connect(identity).await.unwrap();
        // Don't await the spawned burst; just check synchronous effects.
        assert_eq!(*manager.connected_id.lock().unwrap(), Some(1));
        let snapshot = manager.connection_snapshot().await;
        assert_eq!(snapshot.identity_id, Some(1));
    }

    #[tokio::test]
    async fn operation_without_connection_returns_not_connected() {
        let transport = ScriptedTransport::new(vec![]);
        let manager = test_manager(transport);
        let err = manager.select_message("FOO").await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected));
    }

    #[tokio::test]
    async fn create_message_on_printer_is_idempotent_by_uppercased_name() {
        let transport = ScriptedTransport::new(vec!["//EOL\r\n", "//EOL\r\n"]);
        let manager = test_manager(transport);
        let identity = PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1));
        manager.connect(identity).await.unwrap();

        manager.create_message_on_printer("bestcode").await.unwrap();
        manager.create_message_on_printer("BESTCODE").await.unwrap();

        let guard = manager.state.lock().await;
        let state = guard.as_ref().unwrap();
        assert_eq!(state.messages.entries().len(), 1);
        assert_eq!(state.messages.entries()[0].name, "BESTCODE");
    }

    #[tokio::test]
    async fn save_message_content_sends_dm_then_nm_in_order() {
        let transport = ScriptedTransport::new(vec!["//EOL\r\n", "//EOL\r\n"]);
        let manager = test_manager(transport.clone());
        let identity = PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1));
        manager.connect(identity).await.unwrap();

        let field = MessageField::Text {
            x: 0,
            y: 25,
            font: crate::codec::Font::Standard7High,
            data: "HELLO".to_string(),
        };
        manager
            .save_message_content("M1", Template::new(7), Speed::Fast, Rotation::Normal, PrintMode::Normal, &[field], false)
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["^DM M1", "^NM 0;0;0;0;M1^AT1;0;0;2;HELLO"]);
    }

    #[tokio::test]
    async fn reset_counter_rejects_out_of_range_id() {
        let transport = ScriptedTransport::new(vec![]);
        let manager = test_manager(transport);
        let identity = PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1));
        manager.connect(identity).await.unwrap();

        let err = manager.reset_counter(5, 0).await.unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn sign_in_falls_back_to_local_password_on_rejection() {
        let transport = ScriptedTransport::new(vec!["COMMAND FAILED\r\n//EOL\r\n"]);
        let manager = test_manager(transport);
        let identity = PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1));
        manager.connect(identity).await.unwrap();

        manager.sign_in("fallback-pw").await.unwrap();
        assert!(manager.is_signed_in());
    }

    #[tokio::test]
    async fn sign_in_rejects_wrong_local_fallback_password() {
        let transport = ScriptedTransport::new(vec!["COMMAND FAILED\r\n//EOL\r\n"]);
        let manager = test_manager(transport);
        let identity = PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1));
        manager.connect(identity).await.unwrap();

        let err = manager.sign_in("wrong").await.unwrap_err();
        assert!(matches!(err, CoreError::AuthFailed));
        assert!(!manager.is_signed_in());
    }

    #[tokio::test]
    async fn disconnect_clears_connected_state_but_not_availability() {
        let transport = ScriptedTransport::new(vec![]);
        let manager = test_manager(transport);
        let identity = PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1));
        manager.connect(identity).await.unwrap();
        manager.directory.update_status(1, MirrorPatch { available: Some(true), ..Default::default() });

        manager.teardown(false).await;

        assert!(manager.connected_id.lock().unwrap().is_none());
        let mirror = manager.directory.mirror(1).unwrap();
        assert!(mirror.available, "disconnect must not touch availability");
        assert_eq!(mirror.ready_state, ReadyState::NotReady);
    }

    #[test]
    fn last_non_noise_line_skips_prompts_and_echoes() {
        let response = "^SM\r\n>\r\nBESTCODE\r\n//EOL\r\n";
        assert_eq!(last_non_noise_line(response).as_deref(), Some("BESTCODE"));
    }
}
