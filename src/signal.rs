use std::sync::Arc;

use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::mgmt::Reloader;

/// Spawn a thread that handles SIGHUP by rebuilding the address classes from
/// disk
pub fn spawn_sighup_handler(reloader: Arc<Reloader>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("sighup".to_string())
        .spawn(move || {
            let mut signals = match Signals::new([SIGHUP]) {
                Ok(signals) => signals,
                Err(e) => {
                    error!(%e, "failed to register SIGHUP handler, reload via management only");
                    return;
                }
            };

            for sig in signals.forever() {
                if sig == SIGHUP {
                    info!("received SIGHUP, reloading address classes");
                    if let Err(e) = reloader.reload() {
                        error!(%e, "failed to reload address classes, keeping current ones");
                    }
                }
            }
        })
        .expect("Failed to spawn SIGHUP handler thread")
}
