//! The storage seam (spec §6): "a *storage* API for the printer list ...
//! This is the only seam to persistence." This core never persists
//! anything itself; it only reads/writes per-mirror fields through this
//! narrow trait, exactly as `printer.rs`'s `PrinterManager` leaves
//! persistence to the Tauri store plugin and only keeps an in-memory
//! map for its own bookkeeping.

use crate::config::PrinterIdentity;
use crate::model::PrinterMirror;
use std::collections::HashMap;
use std::sync::Mutex;

/// Patch applied to a mirror by a single updater call. `None` fields are
/// left untouched — this is how the Availability Supervisor can update
/// only `available`/`ready_state` without clobbering fluid levels set by
/// the Connection Manager, and vice versa.
#[derive(Debug, Clone, Default)]
pub struct MirrorPatch {
    pub available: Option<bool>,
    pub ready_state: Option<crate::model::ReadyState>,
    pub has_active_errors: Option<bool>,
    pub ink_level: Option<crate::model::FluidLevel>,
    pub makeup_level: Option<crate::model::FluidLevel>,
    pub current_message: Option<Option<String>>,
    pub last_print_count: Option<Option<u32>>,
}

impl MirrorPatch {
    pub fn apply(self, mirror: &mut PrinterMirror) {
        if let Some(v) = self.available {
            mirror.available = v;
        }
        if let Some(v) = self.ready_state {
            mirror.ready_state = v;
        }
        if let Some(v) = self.has_active_errors {
            mirror.has_active_errors = v;
        }
        if let Some(v) = self.ink_level {
            mirror.ink_level = v;
        }
        if let Some(v) = self.makeup_level {
            mirror.makeup_level = v;
        }
        if let Some(v) = self.current_message {
            mirror.current_message = v;
        }
        if let Some(v) = self.last_print_count {
            mirror.last_print_count = v;
        }
    }
}

/// The narrow interface the core expects of the externally-owned printer
/// list. A real HMI backs this with persistent storage; tests back it
/// with `InMemoryDirectory`.
pub trait PrinterDirectory: Send + Sync {
    fn list(&self) -> Vec<PrinterIdentity>;
    fn add(&self, identity: PrinterIdentity);
    fn remove(&self, id: u32);
    fn update(&self, id: u32, patch: &dyn Fn(&mut PrinterIdentity)) -> bool;
    fn set_order(&self, ordered_ids: Vec<u32>);

    fn mirror(&self, id: u32) -> Option<PrinterMirror>;
    fn update_status(&self, id: u32, patch: MirrorPatch);
    fn all_mirrors(&self) -> Vec<PrinterMirror>;
}

/// A minimal in-memory `PrinterDirectory`, used by tests and by the
/// `fleetctl` CLI harness when no external storage collaborator is wired
/// up.
#[derive(Default)]
pub struct InMemoryDirectory {
    identities: Mutex<HashMap<u32, PrinterIdentity>>,
    order: Mutex<Vec<u32>>,
    mirrors: Mutex<HashMap<u32, PrinterMirror>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrinterDirectory for InMemoryDirectory {
    fn list(&self) -> Vec<PrinterIdentity> {
        let order = self.order.lock().unwrap();
        let identities = self.identities.lock().unwrap();
        order.iter().filter_map(|id| identities.get(id).cloned()).collect()
    }

    fn add(&self, identity: PrinterIdentity) {
        let id = identity.id;
        self.mirrors.lock().unwrap().entry(id).or_insert_with(|| PrinterMirror::new(id));
        self.identities.lock().unwrap().insert(id, identity);
        let mut order = self.order.lock().unwrap();
        if !order.contains(&id) {
            order.push(id);
        }
    }

    fn remove(&self, id: u32) {
        self.identities.lock().unwrap().remove(&id);
        self.mirrors.lock().unwrap().remove(&id);
        self.order.lock().unwrap().retain(|x| *x != id);
    }

    fn update(&self, id: u32, patch: &dyn Fn(&mut PrinterIdentity)) -> bool {
        let mut identities = self.identities.lock().unwrap();
        if let Some(identity) = identities.get_mut(&id) {
            patch(identity);
            true
        } else {
            false
        }
    }

    fn set_order(&self, ordered_ids: Vec<u32>) {
        *self.order.lock().unwrap() = ordered_ids;
    }

    fn mirror(&self, id: u32) -> Option<PrinterMirror> {
        self.mirrors.lock().unwrap().get(&id).cloned()
    }

    fn update_status(&self, id: u32, patch: MirrorPatch) {
        let mut mirrors = self.mirrors.lock().unwrap();
        let mirror = mirrors.entry(id).or_insert_with(|| PrinterMirror::new(id));
        patch.apply(mirror);
    }

    fn all_mirrors(&self) -> Vec<PrinterMirror> {
        let order = self.order.lock().unwrap();
        let mirrors = self.mirrors.lock().unwrap();
        order.iter().filter_map(|id| mirrors.get(id).cloned()).collect()
    }
}
