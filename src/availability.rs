//! Availability Supervisor (spec §4.3): a background loop that answers
//! "which printers in the fleet are reachable right now", independent of
//! whatever the Connection Manager happens to be connected to.
//!
//! The connected printer is excluded from probing — spec §4.5 invariant
//! (c): "a mirror for the connected printer is never flipped to offline
//! by the Availability Supervisor alone." The Connection Manager owns
//! that printer's reachability signal via its own command traffic.

use crate::codec;
use crate::config::{Config, PrinterIdentity};
use crate::directory::{MirrorPatch, PrinterDirectory};
use crate::model::{FleetReachabilityCounter, ReadyState};
use crate::transport::{self, TcpTransport, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Runs the fixed-interval reachability sweep described in spec §4.3.
pub struct AvailabilitySupervisor {
    config: Arc<Config>,
    directory: Arc<dyn PrinterDirectory>,
    connected_id: Arc<Mutex<Option<u32>>>,
    enabled: AtomicBool,
    streaks: Mutex<FleetReachabilityCounter>,
}

impl AvailabilitySupervisor {
    pub fn new(
        config: Arc<Config>,
        directory: Arc<dyn PrinterDirectory>,
        connected_id: Arc<Mutex<Option<u32>>>,
    ) -> Self {
        Self {
            config,
            directory,
            connected_id,
            enabled: AtomicBool::new(true),
            streaks: Mutex::new(FleetReachabilityCounter::default()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Forces every mirror offline immediately, e.g. when the HMI shell
    /// reports the host machine's own network link is down.
    pub fn mark_all_not_ready(&self) {
        for mirror in self.directory.all_mirrors() {
            self.directory.update_status(
                mirror.identity_id,
                MirrorPatch { available: Some(false), ready_state: Some(ReadyState::Offline), ..Default::default() },
            );
        }
    }

    /// Runs forever (intended to be spawned as its own task). A single
    /// iteration completes fully before the next one is considered, so
    /// overlapping sweeps never happen.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.availability_interval()).await;
            if !self.enabled.load(Ordering::SeqCst) {
                continue;
            }
            self.sweep_once().await;
        }
    }

    /// One full pass over the fleet, excluding whichever identity is
    /// currently connected. Probes run sequentially with a gap between
    /// them (spec §4.3: "probes are spaced out, never fired as a burst")
    /// so a large fleet doesn't saturate the network link all at once.
    pub async fn sweep_once(&self) {
        let connected = *self.connected_id.lock().unwrap();
        let identities = self.directory.list();
        let mut first = true;

        for identity in identities {
            if Some(identity.id) == connected {
                continue;
            }

            if !first {
                tokio::time::sleep(self.config.probe_inter_gap()).await;
            }
            first = false;

            let reachable = transport::check_status(std::slice::from_ref(&identity))
                .await
                .first()
                .map(|(_, ok)| *ok)
                .unwrap_or(false);

            self.apply_probe_result(identity.id, reachable);

            // "For any printer freshly classified as reachable and not
            // connected, the Supervisor may schedule a one-shot ^SU
            // through an ephemeral transport" (spec §4.3). `identity` is
            // already known not-connected here since the connected id was
            // skipped above.
            if reachable {
                self.refresh_fluid_levels(&identity).await;
            }
        }
    }

    /// Opens a throwaway session, takes one `^SU` snapshot, and closes it.
    /// `apply_probe_result` has already set the baseline `not_ready`/
    /// no-active-errors state for this tick; failure here simply leaves
    /// that baseline (and the last known fluid levels) in place (spec
    /// §4.3: "Failure of a probe does not change availability; it leaves
    /// levels at their last known value and status at not_ready"). Only a
    /// successfully parsed `^SU` may upgrade `ready_state` to `Ready`/
    /// `Error`.
    async fn refresh_fluid_levels(&self, identity: &PrinterIdentity) {
        let transport = TcpTransport::new(self.config.clone());
        transport.set_meta(identity.clone()).await;
        if transport.connect().await.is_err() {
            return;
        }
        let outcome = transport.send_command("^SU").await;
        transport.disconnect().await;
        if !outcome.success {
            return;
        }

        let fields = codec::parse_su(&outcome.response_text);
        if fields.is_empty() {
            return;
        }

        let ready_state = if fields.error_active == Some(true) {
            ReadyState::Error
        } else if fields.is_ready() {
            ReadyState::Ready
        } else {
            ReadyState::NotReady
        };

        self.directory.update_status(
            identity.id,
            MirrorPatch {
                ready_state: Some(ready_state),
                has_active_errors: fields.error_active,
                ink_level: fields.ink_level,
                makeup_level: fields.makeup_level,
                current_message: fields.current_message.clone().map(Some),
                ..Default::default()
            },
        );
        trace!(printer_id = identity.id, "availability probe: refreshed fluid levels");
    }

    fn apply_probe_result(&self, id: u32, reachable: bool) {
        let mut streaks = self.streaks.lock().unwrap();

        if reachable {
            streaks.reset(id);
            trace!(printer_id = id, "availability probe: reachable");
            // Baseline for a freshly-reachable printer is `not_ready` with
            // no active errors (spec §4.3: "status := ready|not_ready based
            // on a follow-up ^SU probe"; the failure clause: "leaves ...
            // status at not_ready"). `refresh_fluid_levels` is the only
            // thing allowed to upgrade this to `Ready`/`Error`, and only on
            // a successfully parsed `^SU`.
            self.directory.update_status(
                id,
                MirrorPatch {
                    available: Some(true),
                    ready_state: Some(ReadyState::NotReady),
                    has_active_errors: Some(false),
                    ..Default::default()
                },
            );
            return;
        }

        let streak = streaks.increment(id);
        if streak >= self.config.offline_threshold {
            debug!(printer_id = id, streak, "availability probe: marking offline");
            if let Some(mut mirror) = self.directory.mirror(id) {
                mirror.mark_offline();
                self.directory.update_status(
                    id,
                    MirrorPatch {
                        available: Some(mirror.available),
                        ready_state: Some(mirror.ready_state),
                        ..Default::default()
                    },
                );
            }
        } else {
            trace!(printer_id = id, streak, "availability probe: unreachable, below threshold");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrinterIdentity;
    use crate::directory::InMemoryDirectory;
    use std::net::Ipv4Addr;

    fn supervisor_with(identities: Vec<PrinterIdentity>) -> (Arc<AvailabilitySupervisor>, Arc<InMemoryDirectory>) {
        let dir = Arc::new(InMemoryDirectory::new());
        for id in identities {
            dir.add(id);
        }
        let mut config = Config::default();
        config.probe_inter_gap_ms = 1;
        config.offline_threshold = 2;
        let sup = Arc::new(AvailabilitySupervisor::new(
            Arc::new(config),
            dir.clone() as Arc<dyn PrinterDirectory>,
            Arc::new(Mutex::new(None)),
        ));
        (sup, dir)
    }

    #[tokio::test]
    async fn unreachable_printer_needs_threshold_misses_before_offline() {
        let identity = PrinterIdentity::new(1, "unreachable", Ipv4Addr::new(127, 0, 0, 1));
        let mut identity = identity;
        identity.port = 1; // nobody listens here
        let (sup, dir) = supervisor_with(vec![identity]);

        sup.sweep_once().await;
        let mirror = dir.mirror(1).unwrap();
        assert!(!mirror.available);
        assert_eq!(mirror.ready_state, crate::model::ReadyState::Offline);

        // Freshly-created mirrors already start Offline/unavailable, so
        // mark it available first to prove the hysteresis actually moves
        // it, then drive two misses to reach the threshold.
        dir.update_status(1, MirrorPatch { available: Some(true), ..Default::default() });
        sup.sweep_once().await;
        assert!(dir.mirror(1).unwrap().available, "single miss must not flip it offline yet");

        sup.sweep_once().await;
        assert!(!dir.mirror(1).unwrap().available, "second consecutive miss reaches the threshold");
    }

    #[tokio::test]
    async fn connected_printer_is_excluded_from_sweep() {
        let identity = PrinterIdentity::new(1, "connected", Ipv4Addr::new(127, 0, 0, 1));
        let mut identity = identity;
        identity.port = 1;
        let (sup, dir) = supervisor_with(vec![identity]);
        dir.update_status(1, MirrorPatch { available: Some(true), ..Default::default() });
        *sup.connected_id.lock().unwrap() = Some(1);

        sup.sweep_once().await;
        sup.sweep_once().await;
        sup.sweep_once().await;

        assert!(dir.mirror(1).unwrap().available, "connected identity must never be probed");
    }
}
