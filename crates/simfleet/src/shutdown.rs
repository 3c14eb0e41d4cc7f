use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

#[derive(Debug)]
pub struct ShutdownController {
    requests: AtomicU8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEvent {
    /// Stop claiming; remote simulations keep running and are resumed on restart.
    Graceful,
    Immediate,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            requests: AtomicU8::new(0),
        }
    }

    /// Records one more Ctrl-C and returns the event it maps to.
    pub fn bump(&self) -> ShutdownEvent {
        match self.requests.fetch_add(1, Ordering::SeqCst) {
            0 => ShutdownEvent::Graceful,
            _ => ShutdownEvent::Immediate,
        }
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
            let event = shutdown.bump();
            let _ = shutdown_tx.send(event);
            if event == ShutdownEvent::Immediate {
                return;
            }
        }
    });
}
