//! Minimal terminal harness for the fleet connection core: add one
//! printer from the command line, connect to it, and drive it with a
//! line-oriented command shell. Exists to exercise [`bestcode_fleet_core`]
//! end-to-end outside of an actual HMI shell.

use bestcode_fleet_core::{
    build_core, Config, InMemoryDirectory, PrinterDirectory, PrinterIdentity,
};
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stdout logging plus a rolling file under `./logs/fleetctl.log`, the way
/// `main.rs`'s `file_appender`/`non_blocking` pair feeds the daemon's own
/// fmt layer. The guard is leaked deliberately: it must outlive every
/// `tracing` call for the rest of the process, and `fleetctl` has no
/// shutdown path that would otherwise drop it cleanly.
fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("bestcode_fleet_core=debug".parse().unwrap())
        .add_directive("fleetctl=debug".parse().unwrap());

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_ansi(true);

    std::fs::create_dir_all("logs").ok();
    let file_appender = tracing_appender::rolling::never("logs", "fleetctl.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    std::mem::forget(guard);
    let file_layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking);

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).with(file_layer).init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let mut args = std::env::args().skip(1);
    let address: Ipv4Addr = match args.next() {
        Some(a) => a.parse().unwrap_or_else(|_| {
            eprintln!("invalid IPv4 address, defaulting to 127.0.0.1");
            Ipv4Addr::new(127, 0, 0, 1)
        }),
        None => {
            eprintln!("usage: fleetctl <printer-ipv4> [port]");
            Ipv4Addr::new(127, 0, 0, 1)
        }
    };
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(bestcode_fleet_core::config::DEFAULT_PORT);

    let config = Arc::new(Config::from_env());
    let directory: Arc<dyn PrinterDirectory> = Arc::new(InMemoryDirectory::new());
    let mut identity = PrinterIdentity::new(1, "fleetctl target", address);
    identity.port = port;
    directory.add(identity.clone());

    let (manager, availability) = build_core(config, directory, None);
    availability.set_enabled(false);

    info!(printer_id = identity.id, %address, port, "connecting");
    if let Err(e) = manager.connect(identity).await {
        error!(error = %e, "connect failed");
        return;
    }
    manager.set_dashboard_open(true);
    tokio::spawn(manager.poller().clone().run());

    println!("connected. commands: su | lm | cn | print-on | print-off | jet-on | jet-off | raw <cmd> | quit");
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        line.clear();
        if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let cmd = line.trim();
        let result = match cmd {
            "quit" | "exit" => break,
            "su" | "lm" | "cn" => manager.send_command(&format!("^{}", cmd.to_ascii_uppercase())).await,
            "print-on" => manager.start_print().await.map(|_| String::new()),
            "print-off" => manager.stop_print().await.map(|_| String::new()),
            "jet-on" => manager.jet_start().await.map(|_| String::new()),
            "jet-off" => manager.jet_stop().await.map(|_| String::new()),
            other if other.starts_with("raw ") => manager.send_command(&other[4..]).await,
            "" => continue,
            _ => {
                println!("unknown command: {}", cmd);
                continue;
            }
        };
        match result {
            Ok(text) if !text.is_empty() => println!("{}", text),
            Ok(_) => println!("ok"),
            Err(e) => println!("error: {}", e),
        }
    }

    manager.disconnect().await;
}
