//! Background lease expiry worker.
//!
//! One [`LeaseManager`] task runs per controller process. It watches
//! global-clock advancement, expires leases whose deadline has passed with
//! an atomic "expire only if still expired" write, and services blocking
//! wait-until-released requests through per-namespace completion channels.
//! Persisted lease state lives entirely in the store; the task's snapshot
//! and waiter registry are rebuilt from the store on every (re)start, so a
//! restart never loses leases and never requires re-claiming.
//!
//! Wake-ups come from the local [`StoreClock`] handle's watch channel:
//! clock advancement is centralized in the process hosting this worker, so
//! an advancement made elsewhere is observed on the next local event
//! rather than immediately. Every scan re-reads both the clock and the
//! lease documents from the store, so a delayed wake-up can only postpone
//! expiry, never mis-time it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lease::{Lease, LeaseStore};
use crate::leadership::LeadershipError;
use crate::names;
use crate::store::StoreError;
use crate::time::{LogicalTime, StoreClock};

type Reply = oneshot::Sender<Result<(), LeadershipError>>;

enum Command {
    Block { namespace: String, reply: Reply },
    Restart { done: oneshot::Sender<()> },
    PendingWaiters { reply: oneshot::Sender<usize> },
}

/// Cloneable handle for talking to a running [`LeaseManager`] task.
///
/// Safe for concurrent use from many caller contexts; registration and
/// cancellation reach the task via channel handoff, never shared state.
#[derive(Clone)]
pub struct LeaseManagerHandle {
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
}

impl LeaseManagerHandle {
    /// Suspend until the namespace's lease is released or expired.
    ///
    /// Returns immediately with success when the namespace is already
    /// vacant. Otherwise exactly one of three outcomes is delivered,
    /// exactly once: success when the lease goes away,
    /// [`LeadershipError::BlockCancelled`] when the caller's cancel signal
    /// fires first, or [`LeadershipError::ManagerStopped`] when the manager
    /// is torn down while waiting (or was already gone). The cancel signal
    /// fires when its sender sends or is dropped. Timeouts are composed by
    /// the caller racing this future against a timer.
    pub async fn block_until_leadership_released(
        &self,
        namespace: &str,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<(), LeadershipError> {
        if !names::is_application(namespace) {
            return Err(LeadershipError::NotValid(format!(
                "cannot wait for lease \"{namespace}\" expiry: not an application name"
            )));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Block {
                namespace: namespace.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| LeadershipError::ManagerStopped)?;
        match cancel {
            None => reply_rx.await.unwrap_or(Err(LeadershipError::ManagerStopped)),
            Some(mut cancel) => tokio::select! {
                res = reply_rx => res.unwrap_or(Err(LeadershipError::ManagerStopped)),
                _ = &mut cancel => Err(LeadershipError::BlockCancelled),
            },
        }
    }

    /// Hot-swap restart: the task re-reads the store and resumes.
    ///
    /// Pending waiters stay registered; waiters whose namespace turns out
    /// to be vacant after the re-read are fulfilled with success. A lease
    /// claimed just before the restart is still honored just after.
    pub async fn restart(&self) -> Result<(), LeadershipError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Restart { done: done_tx })
            .await
            .map_err(|_| LeadershipError::ManagerStopped)?;
        done_rx.await.map_err(|_| LeadershipError::ManagerStopped)
    }

    /// Number of registered waiters, for diagnostics and tests.
    pub async fn pending_waiters(&self) -> Result<usize, LeadershipError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PendingWaiters { reply: reply_tx })
            .await
            .map_err(|_| LeadershipError::ManagerStopped)?;
        reply_rx.await.map_err(|_| LeadershipError::ManagerStopped)
    }

    /// Tear the task down. All pending waiters are fulfilled with
    /// [`LeadershipError::ManagerStopped`]; persisted leases are untouched.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The per-process expiry worker. Owns its lease snapshot and waiter
/// registry exclusively; everything it persists goes through the store.
pub struct LeaseManager {
    leases: LeaseStore,
    clock: Arc<StoreClock>,
    clock_rx: watch::Receiver<LogicalTime>,
    cmd_rx: mpsc::Receiver<Command>,
    shutdown_rx: watch::Receiver<bool>,
    snapshot: BTreeMap<String, Lease>,
    waiters: HashMap<String, Vec<Reply>>,
}

impl LeaseManager {
    /// Spawn the worker task, returning its handle and join handle.
    pub fn start(leases: LeaseStore, clock: Arc<StoreClock>) -> (LeaseManagerHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = LeaseManager {
            clock_rx: clock.watch(),
            leases,
            clock,
            cmd_rx,
            shutdown_rx,
            snapshot: BTreeMap::new(),
            waiters: HashMap::new(),
        };
        let handle = LeaseManagerHandle {
            cmd_tx,
            shutdown_tx,
        };
        let join = tokio::spawn(worker.run());
        (handle, join)
    }

    async fn run(mut self) {
        if let Err(e) = self.resync().await {
            warn!(error = %e, "lease manager could not read store on start");
        }
        info!(leases = self.snapshot.len(), "lease manager running");
        // Some leases may already be due by the time we start.
        self.expire_due().await;

        loop {
            tokio::select! {
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                res = self.clock_rx.changed() => {
                    match res {
                        Ok(()) => self.expire_due().await,
                        // Clock dropped: the coordination substrate is gone.
                        Err(_) => break,
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Block { namespace, reply }) => {
                            self.register_waiter(namespace, reply).await;
                        }
                        Some(Command::Restart { done }) => {
                            self.hot_restart().await;
                            let _ = done.send(());
                        }
                        Some(Command::PendingWaiters { reply }) => {
                            let count = self.waiters.values().map(Vec::len).sum();
                            let _ = reply.send(count);
                        }
                        None => break,
                    }
                }
            }
        }
        self.teardown();
    }

    async fn resync(&mut self) -> Result<(), StoreError> {
        self.snapshot = self.leases.leases().await?;
        Ok(())
    }

    /// Expire every lease whose deadline has passed, fulfilling waiters for
    /// each namespace that becomes vacant.
    async fn expire_due(&mut self) {
        let now = match self.clock.now().await {
            Ok(now) => now,
            Err(e) => {
                warn!(error = %e, "cannot read global clock, skipping expiry scan");
                return;
            }
        };
        // Re-read so claims made by other processes are seen too.
        if let Err(e) = self.resync().await {
            warn!(error = %e, "cannot read store, skipping expiry scan");
            return;
        }
        // Drop registrations whose callers have gone away (cancelled or
        // timed out), so a long-held namespace cannot accumulate dead
        // entries.
        self.waiters.retain(|_, replies| {
            replies.retain(|reply| !reply.is_closed());
            !replies.is_empty()
        });
        let due: Vec<(String, Lease)> = self
            .snapshot
            .iter()
            .filter(|(_, lease)| lease.expired(now))
            .map(|(ns, lease)| (ns.clone(), lease.clone()))
            .collect();
        for (namespace, lease) in due {
            let ops = LeaseStore::expire_ops(&namespace, &lease.holder, now);
            match self.leases.apply(&ops).await {
                Ok(()) => {
                    info!(%namespace, holder = %lease.holder, %now, "lease expired");
                    self.snapshot.remove(&namespace);
                    self.release_waiters(&namespace);
                }
                Err(StoreError::Aborted) => {
                    // A renewal raced the scan; the lease stands.
                    debug!(%namespace, "lease expiry raced a renewal, skipping");
                }
                Err(e) => {
                    warn!(%namespace, error = %e, "failed to expire lease");
                }
            }
        }
        // Another process may have removed a lease we hold waiters for.
        let vacant: Vec<String> = self
            .waiters
            .keys()
            .filter(|ns| !self.snapshot.contains_key(*ns))
            .cloned()
            .collect();
        for namespace in vacant {
            self.release_waiters(&namespace);
        }
    }

    async fn register_waiter(&mut self, namespace: String, reply: Reply) {
        match self.is_vacant(&namespace).await {
            Ok(true) => {
                let _ = reply.send(Ok(()));
            }
            Ok(false) => {
                debug!(%namespace, "waiter registered for lease release");
                self.waiters.entry(namespace).or_default().push(reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn is_vacant(&self, namespace: &str) -> Result<bool, LeadershipError> {
        let now = self.clock.now().await?;
        Ok(match self.leases.read(namespace).await? {
            None => true,
            Some(lease) => lease.expired(now),
        })
    }

    /// Re-read the store and resume, keeping registered waiters. Observers
    /// must see continuity across the swap.
    async fn hot_restart(&mut self) {
        debug!("lease manager restarting");
        self.expire_due().await;
    }

    fn release_waiters(&mut self, namespace: &str) {
        if let Some(replies) = self.waiters.remove(namespace) {
            debug!(namespace, waiters = replies.len(), "releasing lease waiters");
            for reply in replies {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn teardown(&mut self) {
        info!("lease manager stopping");
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Block { reply, .. } => {
                    let _ = reply.send(Err(LeadershipError::ManagerStopped));
                }
                Command::Restart { done } => {
                    let _ = done.send(());
                }
                // Dropping the reply surfaces ManagerStopped to the caller.
                Command::PendingWaiters { .. } => {}
            }
        }
        for (_, replies) in self.waiters.drain() {
            for reply in replies {
                let _ = reply.send(Err(LeadershipError::ManagerStopped));
            }
        }
    }
}
