//! Periodic handshake-timeout sweep.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ConnectionManager;

/// A running sweep task.
pub(super) struct SweepTask {
    pub(super) cancel: CancellationToken,
    pub(super) handle: JoinHandle<()>,
}

/// Sweep `manager` every `period` until cancelled or the manager is dropped.
///
/// The first sweep runs immediately.
pub(super) async fn run_sweep<H: Send + Sync + 'static>(
    manager: Weak<ConnectionManager<H>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let closed = manager.sweep();
                if closed > 0 {
                    debug!(endpoint = manager.endpoint(), closed, "handshake sweep closed connections");
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}
