//! Online/offline signal shared by the capture path, the sync engine and the
//! scheduler.
use crate::remote::RemoteAuthority;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current link state. Returns true on a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Probe the remote authority every `interval` and feed the result into
/// `connectivity`.
pub fn spawn_connectivity_probe(
    remote: Arc<dyn RemoteAuthority>,
    connectivity: Connectivity,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let online = match tokio::time::timeout(interval, remote.health_check()).await {
                        Ok(Ok(())) => true,
                        Ok(Err(err)) => {
                            debug!(error = %err, "health check failed");
                            false
                        }
                        Err(_) => false,
                    };
                    connectivity.set_online(online);
                }
            }
        }
    })
}
