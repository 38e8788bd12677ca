//! Cluster-wide logical time.
//!
//! Lease expiry is compared against a single logical clock persisted in the
//! document store, advanced explicitly by callers rather than by wall-clock
//! ticking. Skewed local clocks across controller processes therefore
//! cannot cause disagreement about whether a lease has expired.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::ops::Add;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::keys;
use crate::store::{Assert, Document, DocumentStore, FieldAssert, Mutate, Op, StoreError};

/// A point on the cluster's logical timeline, in millisecond ticks.
///
/// Logical time never decreases and bears no relation to any wall clock.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTime(u64);

impl LogicalTime {
    pub const ZERO: LogicalTime = LogicalTime(0);

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn millis(self) -> u64 {
        self.0
    }
}

impl Add<Duration> for LogicalTime {
    type Output = LogicalTime;

    fn add(self, d: Duration) -> LogicalTime {
        LogicalTime(self.0.saturating_add(d.as_millis() as u64))
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}ms", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("cannot advance clock for {0}s: non-positive")]
    NonPositive(u64),
    #[error("clock advance abandoned after {0} contended attempts")]
    Contended(usize),
    #[error("clock unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ClockError {
    fn from(e: StoreError) -> Self {
        ClockError::Unavailable(e.to_string())
    }
}

const FIELD_TIME: &str = "time";

/// Conditional-write attempts before an advance gives up on contention.
const MAX_ADVANCE_ATTEMPTS: usize = 10;

/// The cluster-wide logical clock, persisted as a single store document.
///
/// `advance` commits the new value durably before returning, via a
/// conditional write asserting the previously observed value. Consumers
/// other than the advancing caller treat the clock as read-only; in
/// practice advancement is centralized in ops tooling and tests.
pub struct StoreClock {
    store: Arc<dyn DocumentStore>,
    updates: watch::Sender<LogicalTime>,
}

impl StoreClock {
    /// Open the clock over a store, reading the current value (zero if the
    /// clock document does not exist yet).
    pub async fn open(store: Arc<dyn DocumentStore>) -> Result<Self, ClockError> {
        let current = read_time(store.as_ref()).await?;
        let (updates, _) = watch::channel(current);
        Ok(Self { store, updates })
    }

    /// Current cluster time, read from the store.
    pub async fn now(&self) -> Result<LogicalTime, ClockError> {
        read_time(self.store.as_ref()).await
    }

    /// Durably move the cluster clock forward by `d`, returning the new
    /// time. Concurrent advancers are resolved by re-reading and retrying
    /// the conditional write.
    pub async fn advance(&self, d: Duration) -> Result<LogicalTime, ClockError> {
        if d.is_zero() {
            return Err(ClockError::NonPositive(0));
        }
        for _ in 0..MAX_ADVANCE_ATTEMPTS {
            let current = self.now().await?;
            let next = current + d;
            let assert = if current == LogicalTime::ZERO {
                // The document may not exist yet; both shapes assert the
                // value we based `next` on.
                match self.store.read(keys::global_clock_key()).await? {
                    None => Assert::Missing,
                    Some(_) => at_time(current),
                }
            } else {
                at_time(current)
            };
            let op = Op {
                key: keys::global_clock_key().to_string(),
                assert,
                mutate: Mutate::Put(clock_document(next)),
            };
            match self.store.atomic_apply(&[op]).await {
                Ok(()) => {
                    debug!(from = %current, to = %next, "global clock advanced");
                    self.updates.send_replace(next);
                    return Ok(next);
                }
                Err(StoreError::Aborted) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ClockError::Contended(MAX_ADVANCE_ATTEMPTS))
    }

    /// Subscribe to advancements made through this clock handle.
    pub fn watch(&self) -> watch::Receiver<LogicalTime> {
        self.updates.subscribe()
    }
}

fn at_time(t: LogicalTime) -> Assert {
    Assert::Fields(vec![FieldAssert::Eq(FIELD_TIME.into(), json!(t.millis()))])
}

fn clock_document(t: LogicalTime) -> Document {
    let mut doc = Document::new();
    doc.insert(FIELD_TIME.into(), json!(t.millis()));
    doc
}

async fn read_time(store: &dyn DocumentStore) -> Result<LogicalTime, ClockError> {
    let doc = store.read(keys::global_clock_key()).await?;
    Ok(doc
        .as_ref()
        .and_then(|d| d.get(FIELD_TIME))
        .and_then(Value::as_u64)
        .map(LogicalTime::from_millis)
        .unwrap_or(LogicalTime::ZERO))
}
