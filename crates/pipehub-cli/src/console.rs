//! Terminal side of a session: stdin lines in, relayed frames and status
//! lines out.

use pipehub_core::Role;
use std::io::{BufRead, Write};
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Forward lines from `input` to `outbox` until EOF or the receiver closes.
pub fn forward_lines<R: BufRead>(input: R, outbox: &mpsc::Sender<String>) {
    for line in input.lines() {
        match line {
            Ok(line) => {
                if outbox.blocking_send(line).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to read input: {}", e);
                return;
            }
        }
    }
}

/// Read stdin on a dedicated thread; stdin has no async reader that can be
/// cancelled, so the thread is left to die with the process.
pub fn spawn_stdin_reader(outbox: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        forward_lines(std::io::stdin().lock(), &outbox);
    });
}

/// Print every relayed frame on its own line.
pub async fn print_inbox<W: Write>(mut inbox: mpsc::Receiver<String>, mut out: W) {
    while let Some(line) = inbox.recv().await {
        if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
            return;
        }
    }
}

/// Status line shown when this process takes `role`.
pub fn status_line(role: Role, endpoint: &str) -> String {
    match role {
        Role::Hub => format!("[pipehub] hosting '{}'; type to broadcast, 'exit' to quit", endpoint),
        Role::Client => format!("[pipehub] connected to hub '{}'; 'exit' to quit", endpoint),
        Role::Unknown => "[pipehub] hub changed; electing...".to_string(),
    }
}

/// Print a status line for every role change.
pub async fn report_roles(mut roles: watch::Receiver<Role>, endpoint: String) {
    while roles.changed().await.is_ok() {
        let role = *roles.borrow_and_update();
        println!("{}", status_line(role, &endpoint));
    }
}
