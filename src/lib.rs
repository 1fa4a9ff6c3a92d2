//! Connection core for a BestCode continuous-inkjet printer fleet HMI.
//!
//! Five collaborators, each owning one concern (spec §2):
//! [`transport`] (one TCP/Telnet session per printer), [`codec`] (pure
//! parse/format), [`availability`] (fleet-wide reachability sweep),
//! [`poller`] (serialized live-state refresh of the connected printer),
//! and [`connection`] (the orchestrator every other component serves).
//! [`directory`] is the storage seam the HMI shell implements;
//! [`config`] and [`model`] are the shared types; [`errors`] is the
//! shared error taxonomy.

pub mod availability;
pub mod codec;
pub mod config;
pub mod connection;
pub mod directory;
pub mod errors;
pub mod model;
pub mod poller;
pub mod transport;

pub use availability::AvailabilitySupervisor;
pub use config::{Config, PrinterIdentity};
pub use connection::{ConnectionManager, ConnectionSnapshot, CoreEvent, GlobalAdjust, TransportFactory};
pub use directory::{InMemoryDirectory, MirrorPatch, PrinterDirectory};
pub use errors::{CoreError, Result};
pub use model::{FluidLevel, PrintMode, PrinterMirror, ReadyState, Rotation, Speed};
pub use poller::SerializedPoller;
pub use transport::{TcpTransport, Transport};

use std::sync::{Arc, Mutex};

/// Wires the five components together the way the HMI shell is expected
/// to (spec §2's dependency order: Transport ← Codec ← Availability
/// Supervisor ← Serialized Poller ← Connection Manager). Returns the
/// `ConnectionManager` and `AvailabilitySupervisor`; the caller is
/// responsible for spawning `AvailabilitySupervisor::run` and
/// `ConnectionManager::poller().run` as background tasks, since only the
/// HMI shell knows its own process's task-spawning conventions.
pub fn build_core(
    config: Arc<Config>,
    directory: Arc<dyn PrinterDirectory>,
    local_password: Option<String>,
) -> (Arc<ConnectionManager>, Arc<AvailabilitySupervisor>) {
    let connected_id = Arc::new(Mutex::new(None));

    let transport_config = config.clone();
    let transport_factory: TransportFactory =
        Arc::new(move || Arc::new(TcpTransport::new(transport_config.clone())) as Arc<dyn Transport>);

    let manager = ConnectionManager::new(
        config.clone(),
        directory.clone(),
        transport_factory,
        connected_id.clone(),
        local_password,
    );

    let availability = Arc::new(AvailabilitySupervisor::new(config, directory, connected_id));

    (manager, availability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn build_core_wires_up_without_panicking() {
        let dir: Arc<dyn PrinterDirectory> = Arc::new(InMemoryDirectory::new());
        dir.add(PrinterIdentity::new(1, "Line 1", Ipv4Addr::new(127, 0, 0, 1)));

        let (manager, availability) = build_core(Arc::new(Config::default()), dir, None);
        assert!(!manager.is_signed_in());
        availability.set_enabled(false);
    }
}
