//! Upstream election: which beacon client is allowed to drive the builders.
//!
//! Several redundant beacon clients talk to the multiplexer, but only the
//! one with the freshest view of the chain should steer forkchoice. The
//! election holds at most one record at a time: the address of the current
//! best client and the highest marker observed from it. A strictly greater
//! marker from another address takes the election over; an expiry timer
//! demotes a client that goes silent.
//!
//! One mutex covers both the record and the timer deadline. The critical
//! sections never block; the expiry sleeper runs on its own task and is
//! rearmed through a [`Notify`].

use crate::{config::ElectionMode, types::RpcRequest};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, Notify},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info};

/// The currently elected beacon client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestBeacon {
    /// Normalized network address the client was observed from.
    pub remote: String,
    /// Highest marker observed during this election. Resets to 0 when the
    /// election changes hands.
    pub marker: u64,
}

#[derive(Debug, Default)]
struct Inner {
    best: Option<BestBeacon>,
    /// Armed iff `best` is present.
    deadline: Option<Instant>,
}

/// Election state shared by all in-flight requests.
#[derive(Debug)]
pub struct BeaconElection {
    inner: Mutex<Inner>,
    mode: ElectionMode,
    expiry: Duration,
    changed: Notify,
}

impl BeaconElection {
    #[must_use]
    pub fn new(mode: ElectionMode, expiry: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            mode,
            expiry,
            changed: Notify::new(),
        }
    }

    /// The configured marker source.
    #[must_use]
    pub fn mode(&self) -> ElectionMode {
        self.mode
    }

    /// Feeds one decoded request into the election.
    ///
    /// Installs the sender at marker 0 when no client is elected, takes
    /// the election over when the request carries a strictly greater
    /// marker, and rearms the expiry timer whenever the sender is the
    /// elected client. Equal markers never switch the election.
    pub fn observe(&self, request: &RpcRequest, remote: &str) {
        let marker = match self.mode {
            ElectionMode::Timestamp => request.timestamp_marker(),
            ElectionMode::Slot => request.slot_marker(),
        };

        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.best.is_none() {
            info!(remote = %remote, method = %request.method, "electing beacon client");
            inner.best = Some(BestBeacon {
                remote: remote.to_owned(),
                marker: 0,
            });
            inner.deadline = Some(now + self.expiry);
        }

        if let (Some(marker), Some(best)) = (marker, inner.best.as_mut()) {
            if marker > best.marker {
                info!(
                    old_marker = best.marker,
                    old_remote = %best.remote,
                    new_marker = marker,
                    new_remote = %remote,
                    method = %request.method,
                    "beacon client advanced the election marker"
                );
                *best = BestBeacon {
                    remote: remote.to_owned(),
                    marker,
                };
            }
        }

        if inner.best.as_ref().is_some_and(|best| best.remote == remote) {
            inner.deadline = Some(now + self.expiry);
        }

        drop(inner);
        self.changed.notify_one();
    }

    /// Whether `remote` is the currently elected beacon client.
    #[must_use]
    pub fn is_elected(&self, remote: &str) -> bool {
        self.inner
            .lock()
            .best
            .as_ref()
            .is_some_and(|best| best.remote == remote)
    }

    /// A snapshot of the current election record.
    #[must_use]
    pub fn current(&self) -> Option<BestBeacon> {
        self.inner.lock().best.clone()
    }

    /// Runs the expiry sleeper until the shutdown channel closes or fires.
    ///
    /// The sleeper waits on the armed deadline and clears the election
    /// when it elapses unchanged; any `observe` that rearms the timer
    /// wakes the sleeper to pick up the new deadline.
    pub fn spawn_expiry_task(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let election = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = election.inner.lock().deadline;
                match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            () = time::sleep_until(deadline) => {
                                let mut inner = election.inner.lock();
                                // A rearm may have moved the deadline while
                                // we slept; only an unchanged one expires.
                                if inner.deadline == Some(deadline) {
                                    if let Some(best) = inner.best.take() {
                                        debug!(
                                            remote = %best.remote,
                                            marker = best.marker,
                                            "beacon election expired"
                                        );
                                    }
                                    inner.deadline = None;
                                }
                            }
                            () = election.changed.notified() => {}
                            _ = shutdown.recv() => break,
                        }
                    }
                    None => {
                        tokio::select! {
                            () = election.changed.notified() => {}
                            _ = shutdown.recv() => break,
                        }
                    }
                }
            }
        })
    }
}
