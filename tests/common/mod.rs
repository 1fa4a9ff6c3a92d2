//! A minimal in-process fake BestCode printer, built directly on
//! `tokio::net::TcpListener` (see DESIGN.md / SPEC_FULL.md Expansion D).
//! `wiremock` is HTTP-only and this protocol is raw ASCII-over-TCP, so the
//! pack's own `tests/common::MockPrinter` trick — hand the thing under test
//! a reachable localhost endpoint — is reproduced here against a real
//! socket instead of an in-memory struct.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use bestcode_fleet_core::PrinterIdentity;

/// A scripted reply: the exact bytes written back after a command's `CR`.
/// Callers own the `//EOL` sentinel; it is not added automatically, since
/// some tests deliberately exercise a response that omits it.
pub type ScriptedReply = String;

/// A fake printer that accepts one connection at a time and answers each
/// two-letter command mnemonic it recognises with a scripted reply,
/// falling back to a generic `COMMAND SUCCESSFUL` sentinel for anything
/// unscripted.
pub struct FakePrinter {
    port: u16,
    replies: Arc<Mutex<HashMap<String, ScriptedReply>>>,
    /// Lets a test assert on exactly what was sent, in order.
    received: Arc<Mutex<Vec<String>>>,
    /// Unsolicited text pushed right after a given mnemonic's framed
    /// reply, still inside the same write — it lands in the client's
    /// socket buffer before the next command is ever sent, exactly like
    /// an ambient status line the device emits between commands.
    ambient_after: Arc<Mutex<HashMap<String, String>>>,
}

impl FakePrinter {
    /// Binds an ephemeral localhost port and spawns the accept loop.
    pub async fn start() -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind fake printer");
        let port = listener.local_addr().unwrap().port();
        let replies: Arc<Mutex<HashMap<String, ScriptedReply>>> = Arc::new(Mutex::new(HashMap::new()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let ambient_after: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));

        let replies_task = replies.clone();
        let received_task = received.clone();
        let ambient_task = ambient_after.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let replies = replies_task.clone();
                let received = received_task.clone();
                let ambient = ambient_task.clone();
                tokio::spawn(serve_one_connection(stream, replies, received, ambient));
            }
        });

        Self { port, replies, received, ambient_after }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identity(&self, id: u32, name: &str) -> PrinterIdentity {
        let mut identity = PrinterIdentity::new(id, name, Ipv4Addr::LOCALHOST);
        identity.port = self.port;
        identity
    }

    /// Registers the literal response body (caller includes `//EOL` if
    /// desired) for a given command mnemonic, e.g. `"^SU"`.
    pub async fn script(&self, mnemonic: &str, reply: impl Into<String>) {
        self.replies.lock().await.insert(mnemonic.trim().to_ascii_uppercase(), reply.into());
    }

    /// Appends an unsolicited line right after `mnemonic`'s framed reply,
    /// in the same write. Simulates an ambient status push that lands
    /// between a real response and the next command the caller sends.
    pub async fn script_ambient_after(&self, mnemonic: &str, ambient_line: impl Into<String>) {
        self.ambient_after.lock().await.insert(mnemonic.trim().to_ascii_uppercase(), ambient_line.into());
    }

    pub async fn received_commands(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }
}

async fn serve_one_connection(
    stream: tokio::net::TcpStream,
    replies: Arc<Mutex<HashMap<String, ScriptedReply>>>,
    received: Arc<Mutex<Vec<String>>>,
    ambient_after: Arc<Mutex<HashMap<String, String>>>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];

    loop {
        // Read until a bare CR terminates one outbound command (spec §6:
        // "Command framing terminated by CR").
        let cr_pos = loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\r') {
                break Some(pos);
            }
            match reader.read(&mut chunk).await {
                Ok(0) => break None,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => break None,
            }
        };
        let Some(pos) = cr_pos else { return };

        let command: String = String::from_utf8_lossy(&buf[..pos]).to_string();
        buf.drain(..=pos);
        received.lock().await.push(command.clone());

        let mnemonic = command.split(|c: char| c == ' ' || c == ';').next().unwrap_or("").to_ascii_uppercase();
        let reply = replies.lock().await.get(&mnemonic).cloned();
        let body = reply.unwrap_or_else(|| "COMMAND SUCCESSFUL".to_string());
        let mut framed = if body.contains("//EOL") { body } else { format!("{}\r\n//EOL\r\n", body) };
        if let Some(ambient) = ambient_after.lock().await.get(&mnemonic).cloned() {
            framed.push_str(&ambient);
            if !ambient.ends_with('\n') {
                framed.push_str("\r\n");
            }
        }

        if reader.get_mut().write_all(framed.as_bytes()).await.is_err() {
            return;
        }
    }
}
