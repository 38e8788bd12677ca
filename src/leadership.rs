//! Leadership claim and verification APIs.
//!
//! [`Claimer`] is the write path: it claims or renews a namespace's lease
//! with a single conditional store write, so two concurrent claims for a
//! vacant namespace resolve with exactly one winner. [`Checker`] is the
//! read path: it issues [`Token`]s that re-verify leadership against live
//! state on every call and can contribute an assertion op to an external
//! transaction, making that transaction atomically contingent on
//! leadership not changing before commit.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::lease::LeaseStore;
use crate::names;
use crate::store::{Op, StoreError};
use crate::time::{ClockError, StoreClock};

#[derive(Debug, Error)]
pub enum LeadershipError {
    /// Malformed namespace, holder, or duration; detected before any store
    /// access. The message text is part of the observable contract.
    #[error("{0}")]
    NotValid(String),
    /// Another holder has an unexpired lease. An expected contention
    /// outcome, not a fault; callers branch on it explicitly.
    #[error("lease claim denied")]
    ClaimDenied,
    /// The holder no longer leads the namespace.
    #[error("\"{holder}\" is not leader of \"{namespace}\"")]
    NotLeader { holder: String, namespace: String },
    /// The caller's cancel signal fired before the lease was released.
    #[error("lease block cancelled")]
    BlockCancelled,
    /// The lease manager (or its store connection) was torn down.
    #[error("lease manager stopped")]
    ManagerStopped,
    /// Conditional writes kept racing other writers; the caller decides
    /// whether to try again.
    #[error("lease claim abandoned after {0} contended attempts")]
    ExcessiveContention(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Clock(#[from] ClockError),
}

fn not_valid(message: String) -> LeadershipError {
    LeadershipError::NotValid(message)
}

/// Renders a duration the way validation messages expect: whole seconds.
fn duration_secs(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

/// Conditional-write attempts before a claim reports excessive contention.
/// Each retry re-reads the lease first, so legitimate denial is still
/// detected rather than masked.
pub const DEFAULT_MAX_CLAIM_ATTEMPTS: usize = 5;

/// The leadership write path. Stateless facade over the lease store and
/// global clock; safe for concurrent use.
#[derive(Clone)]
pub struct Claimer {
    leases: LeaseStore,
    clock: Arc<StoreClock>,
    max_attempts: usize,
}

impl Claimer {
    pub fn new(leases: LeaseStore, clock: Arc<StoreClock>) -> Self {
        Self::with_max_attempts(leases, clock, DEFAULT_MAX_CLAIM_ATTEMPTS)
    }

    pub fn with_max_attempts(
        leases: LeaseStore,
        clock: Arc<StoreClock>,
        max_attempts: usize,
    ) -> Self {
        Self {
            leases,
            clock,
            max_attempts,
        }
    }

    /// Claim leadership of `namespace` for `holder` until `duration` past
    /// the current cluster time.
    ///
    /// Succeeds when the namespace is vacant or when `holder` already leads
    /// (renewal extends the expiry). Fails with
    /// [`LeadershipError::ClaimDenied`] when a different holder has an
    /// unexpired lease.
    pub async fn claim_leadership(
        &self,
        namespace: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<(), LeadershipError> {
        if !names::is_application(namespace) {
            return Err(not_valid(format!(
                "cannot claim lease \"{namespace}\": not an application name"
            )));
        }
        if !names::is_unit(holder) {
            return Err(not_valid(format!(
                "cannot claim lease for holder \"{holder}\": not a unit name"
            )));
        }
        if duration.is_zero() {
            return Err(not_valid(format!(
                "cannot claim lease for {}: non-positive",
                duration_secs(duration)
            )));
        }

        for _ in 0..self.max_attempts {
            let now = self.clock.now().await?;
            let expiry = now + duration;
            let ops = match self.leases.read(namespace).await? {
                None => LeaseStore::claim_ops(namespace, holder, expiry),
                Some(lease) if lease.holder == holder => {
                    LeaseStore::extend_ops(namespace, holder, expiry)
                }
                Some(lease) if lease.expired(now) => {
                    LeaseStore::takeover_ops(namespace, &lease.holder, holder, expiry, now)
                }
                Some(_) => return Err(LeadershipError::ClaimDenied),
            };
            match self.leases.apply(&ops).await {
                Ok(()) => {
                    debug!(namespace, holder, %expiry, "lease claimed");
                    return Ok(());
                }
                Err(StoreError::Aborted) => {
                    // Raced another writer; re-read and decide again.
                    debug!(namespace, holder, "lease claim raced, re-evaluating");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LeadershipError::ExcessiveContention(self.max_attempts))
    }
}

/// The leadership read path: issues verification tokens.
#[derive(Clone)]
pub struct Checker {
    leases: LeaseStore,
    clock: Arc<StoreClock>,
}

impl Checker {
    pub fn new(leases: LeaseStore, clock: Arc<StoreClock>) -> Self {
        Self { leases, clock }
    }

    /// Build a token for re-verifying that `holder` leads `namespace`.
    /// Pure construction; validation happens on [`Token::check`].
    pub fn leadership_check(
        &self,
        namespace: impl Into<String>,
        holder: impl Into<String>,
    ) -> Token {
        Token {
            namespace: namespace.into(),
            holder: holder.into(),
            leases: self.leases.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

/// A reusable leadership query handle for one `(namespace, holder)` pair.
///
/// Not a cached proof: every [`Token::check`] re-reads live lease state
/// against the current cluster time. The token's value lies in late-binding
/// verification inside a larger transaction.
#[derive(Clone)]
pub struct Token {
    namespace: String,
    holder: String,
    leases: LeaseStore,
    clock: Arc<StoreClock>,
}

impl Token {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Verify that the holder currently leads the namespace.
    ///
    /// On success, when `ops_out` is supplied, appends an assertion op
    /// encoding "this lease is still held by the holder", so an external
    /// transaction can be made conditional on leadership surviving until
    /// commit. On failure `ops_out` is left untouched.
    pub async fn check(&self, ops_out: Option<&mut Vec<Op>>) -> Result<(), LeadershipError> {
        if !names::is_application(&self.namespace) {
            return Err(not_valid(format!(
                "cannot check lease \"{}\": not an application name",
                self.namespace
            )));
        }
        if !names::is_unit(&self.holder) {
            return Err(not_valid(format!(
                "cannot check holder \"{}\": not a unit name",
                self.holder
            )));
        }

        let now = self.clock.now().await?;
        match self.leases.read(&self.namespace).await? {
            Some(lease) if lease.holder == self.holder && !lease.expired(now) => {
                if let Some(ops) = ops_out {
                    ops.push(LeaseStore::check_op(&self.namespace, &self.holder));
                }
                Ok(())
            }
            _ => Err(LeadershipError::NotLeader {
                holder: self.holder.clone(),
                namespace: self.namespace.clone(),
            }),
        }
    }
}
