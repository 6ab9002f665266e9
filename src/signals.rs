//! Installs a signal handler which terminates the server on CTRL+C or SIGHUP.
//!
//! Forks an async task which waits for either **CTRL+C** or **SIGHUP** and then invokes
//! [Server::terminate](crate::server::Server::terminate) on the given server.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::server::Server;

/// Installs a signal handler for the given server which awaits either a **CTRL+C** or **SIGHUP**.
pub fn install(server: Arc<Server>) {
    let _ = tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sig_hup = tokio::signal::unix::signal(SignalKind::hangup()).unwrap();

        tokio::select! {
            _ = ctrl_c => {
                log::info!("Received CTRL-C. Shutting down...");
                server.terminate();
            },
            _ = sig_hup.recv() => {
               log::info!("Received SIGHUP. Shutting down...");
                server.terminate();
            }
        }
    });
}
