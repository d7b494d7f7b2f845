//! Background expiry of pending invitations.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use staybase_auth::{AuthorizationStore, InvitationService};

/// Handle for a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<usize>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the task to stop.
    ///
    /// Returns the total number of invitations the task expired.
    pub async fn shutdown(mut self) -> usize {
        let _ = self.shutdown.send(true);
        match self.join.take() {
            Some(join) => join.await.unwrap_or_else(|e| {
                warn!(error = %e, "invitation sweeper task failed");
                0
            }),
            None => 0,
        }
    }
}

/// Periodically calls [`InvitationService::sweep`].
///
/// Acceptance checks expiry itself, so the sweeper only keeps stored statuses
/// current; a failed pass is logged and retried on the next tick.
#[derive(Debug)]
pub struct InvitationSweeper;

impl InvitationSweeper {
    /// Spawn onto the current tokio runtime. The first pass runs immediately.
    pub fn spawn<S>(service: InvitationService<S>, interval: Duration) -> SweeperHandle
    where
        S: AuthorizationStore + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut total = 0usize;

            info!(interval_secs = interval.as_secs(), "invitation sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match service.sweep(Utc::now()).await {
                            Ok(expired) => {
                                total += expired;
                                debug!(expired, "sweep pass complete");
                            }
                            Err(e) => warn!(error = %e, "sweep pass failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(total, "invitation sweeper stopped");
            total
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
