//! The external reload collaborator seam.
//!
//! The server does not know how to re-instantiate content from disk; it only
//! signals that the mapped directories changed. Handlers must tolerate
//! back-to-back calls (the server already coalesces bursts, but a reload may
//! still be requested while a previous one settles).

use std::process::Command;

use tracing::{info, warn};

/// Receives coalesced reload requests from the server.
pub trait ReloadHandler: Send + Sync {
    fn request_reload(&self);
}

/// Default handler: just records that a reload would happen.
pub struct LogReload;

impl ReloadHandler for LogReload {
    fn request_reload(&self) {
        info!("files updated, reload requested");
    }
}

/// Runs a shell command on each reload request (`--on-reload`). The command
/// is fire-and-forget: the server does not wait for it and a spawn failure
/// only logs.
pub struct CommandReload {
    command: String,
}

impl CommandReload {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl ReloadHandler for CommandReload {
    fn request_reload(&self) {
        info!(command = %self.command, "files updated, running reload command");
        match Command::new("sh").arg("-c").arg(&self.command).spawn() {
            Ok(mut child) => {
                // Reap the child off the control thread so it never zombies.
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(err) => {
                warn!(command = %self.command, %err, "failed to run reload command");
            }
        }
    }
}
