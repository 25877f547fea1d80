//! Ctrl-C handling: first press requests a graceful stop, a second press
//! forces an immediate exit. Adapted from the teacher's
//! `crates/client/src/shutdown.rs`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

#[derive(Debug)]
pub struct ShutdownController {
    forced: AtomicU8,
}

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    Graceful,
    Immediate,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

pub fn spawn_ctrl_c_handler(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>,
) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                let _ = shutdown_tx.send(ShutdownEvent::Graceful);
            } else {
                let _ = shutdown_tx.send(ShutdownEvent::Immediate);
                return;
            }
        }
    });
}
