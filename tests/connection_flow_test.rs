//! End-to-end tests driving the Connection Manager and Poller against the
//! in-process fake printer (see `tests/common`), per SPEC_FULL.md
//! Expansion D: "Integration tests under `tests/` drive the Connection
//! Manager and Poller end-to-end against this fake server."

mod common;

use bestcode_fleet_core::{build_core, Config, InMemoryDirectory, PrinterDirectory};
use common::FakePrinter;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> Arc<Config> {
    let mut cfg = Config::default();
    cfg.post_connect_settle_ms = 10;
    cfg.command_timeout_ms = 2_000;
    cfg.polling_interval_ms = 50;
    cfg.clock_polling_interval_ms = 50;
    Arc::new(cfg)
}

#[tokio::test]
#[serial]
async fn connect_runs_initial_burst_and_populates_snapshot() {
    let printer = FakePrinter::start().await;
    printer
        .script(
            "^SU",
            "V300UP:1 VLT_ON:1 GUT_ON:1 MOD_ON:1 MOD[110] CHG[75] PRS[42] RPS[1.50] PHQ[88] HVD[1] VIS[1.02] \
             INK:GOOD MAKEUP:FULL Print Status: Ready Message: BESTCODE",
        )
        .await;
    printer.script("^LM", "Messages (1):\r\n1. BESTCODE (current)").await;
    printer.script("^CN", "308,7,10,21,34,45").await;
    printer.script("^VV", "Firmware v2.6.3").await;
    printer.script("^SD", "01/15/2026 14:30:00").await;

    let dir: Arc<dyn PrinterDirectory> = Arc::new(InMemoryDirectory::new());
    let identity = printer.identity(1, "Line 1");
    dir.add(identity.clone());

    let (manager, availability) = build_core(fast_config(), dir.clone(), None);
    availability.set_enabled(false);

    manager.connect(identity).await.unwrap();

    // The initial burst runs on a spawned task; give it a moment to finish
    // its sequential SU/LM/CN/VV/SD round trip against the fake printer.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = manager.connection_snapshot().await;
    let status = snapshot.status.expect("status populated after burst");
    assert!(status.hv_on);
    assert!(status.jet_running);
    assert_eq!(status.current_message.as_deref(), Some("BESTCODE"));
    assert_eq!(status.product_count, 308);
    assert_eq!(status.print_count, 7);
    assert_eq!(status.firmware_version.as_deref(), Some("2.6.3"));
    assert!(status.device_clock.is_some());

    let mirror = dir.mirror(1).unwrap();
    assert_eq!(mirror.ready_state, bestcode_fleet_core::ReadyState::Ready);
    assert!(mirror.available);
}

#[tokio::test]
#[serial]
async fn start_print_sends_pr_and_schedules_su_confirmation() {
    let printer = FakePrinter::start().await;
    printer.script("^PR", "COMMAND SUCCESSFUL").await;
    printer.script("^SU", "VLT_ON:1 Print Status: Ready").await;

    let dir: Arc<dyn PrinterDirectory> = Arc::new(InMemoryDirectory::new());
    let identity = printer.identity(1, "Line 1");
    dir.add(identity.clone());

    let (manager, availability) = build_core(fast_config(), dir, None);
    availability.set_enabled(false);
    manager.connect(identity).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.start_print().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = printer.received_commands().await;
    assert!(sent.iter().any(|c| c.starts_with("^PR")), "expected a ^PR command, got {:?}", sent);
}

#[tokio::test]
#[serial]
async fn serialized_poller_issues_fixed_command_order() {
    let printer = FakePrinter::start().await;
    printer.script("^SU", "Print Status: Ready").await;
    printer.script("^LM", "Messages (0):").await;
    printer.script("^CN", "0,0,0,0,0,0").await;
    printer.script("^TP", "28.0,30.0").await;
    printer.script("^SD", "01/15/2026 00:00:00").await;

    let dir: Arc<dyn PrinterDirectory> = Arc::new(InMemoryDirectory::new());
    let identity = printer.identity(1, "Line 1");
    dir.add(identity.clone());

    let (manager, availability) = build_core(fast_config(), dir, None);
    availability.set_enabled(false);
    manager.connect(identity).await.unwrap();
    manager.set_dashboard_open(true);
    tokio::spawn(manager.poller().clone().run());

    // Initial burst plus at least one full poll cycle.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let sent = printer.received_commands().await;
    let mnemonics: Vec<String> = sent
        .iter()
        .map(|c| c.split(|ch: char| ch == ' ' || ch == ';').next().unwrap_or("").to_string())
        .collect();

    // The burst itself isn't order-constrained relative to the poller
    // (different tasks), but within any contiguous poller cycle the
    // sequence ^SU,^LM,^CN,^TP,^SD must hold (spec §4.4, §8 property 4).
    let poll_cycle = ["^SU", "^LM", "^CN", "^TP", "^SD"];
    let windows: Vec<&[String]> = mnemonics.windows(5).collect();
    assert!(
        windows.iter().any(|w| w.iter().map(|s| s.as_str()).eq(poll_cycle.iter().copied())),
        "expected a contiguous ^SU,^LM,^CN,^TP,^SD window in {:?}",
        mnemonics
    );
}

#[tokio::test]
#[serial]
async fn ambient_line_between_commands_does_not_leak_into_next_response() {
    // An unsolicited status push lands right after ^SU's framed reply, in
    // the same write — by the time the initial burst's next command (^LM)
    // is sent, that ambient line is already sitting unread in the socket
    // buffer. Without draining it first, ^LM's own idle-quiescence read
    // could pick it up as if it were part of ^LM's response.
    let printer = FakePrinter::start().await;
    printer.script("^SU", "Print Status: Ready").await;
    printer.script_ambient_after("^SU", "ALARM: LOW INK\r\n").await;
    printer.script("^LM", "Messages (1):\r\n1. GOODJOB").await;
    printer.script("^CN", "0,0,0,0,0,0").await;
    printer.script("^VV", "Firmware v2.6.3").await;
    printer.script("^SD", "01/15/2026 00:00:00").await;

    let dir: Arc<dyn PrinterDirectory> = Arc::new(InMemoryDirectory::new());
    let identity = printer.identity(1, "Line 1");
    dir.add(identity.clone());

    let (manager, availability) = build_core(fast_config(), dir, None);
    availability.set_enabled(false);
    manager.connect(identity).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = manager.connection_snapshot().await;
    assert_eq!(snapshot.messages.len(), 1, "ambient line must not be parsed as part of ^LM's reply");
    assert_eq!(snapshot.messages[0].name, "GOODJOB");
}

#[tokio::test]
#[serial]
async fn disconnect_clears_socket_ready_but_not_availability() {
    let printer = FakePrinter::start().await;
    printer.script("^SU", "Print Status: Ready").await;

    let dir: Arc<dyn PrinterDirectory> = Arc::new(InMemoryDirectory::new());
    let identity = printer.identity(1, "Line 1");
    dir.add(identity.clone());

    let (manager, availability) = build_core(fast_config(), dir.clone(), None);
    availability.set_enabled(false);
    manager.connect(identity).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    dir.update_status(1, bestcode_fleet_core::MirrorPatch { available: Some(true), ..Default::default() });
    manager.disconnect().await;

    let snapshot = manager.connection_snapshot().await;
    assert!(!snapshot.socket_ready);
    assert!(dir.mirror(1).unwrap().available, "disconnect must not touch availability");
}
