//! Lease documents and the conditional-op vocabulary for mutating them.
//!
//! A lease binds a namespace (an application) to a holder (one of its
//! units) until a logical expiry time. At most one unexpired lease exists
//! per namespace; a namespace with no unexpired lease is vacant. All
//! mutations are expressed as op batches so callers can merge lease
//! preconditions into their own transactions.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::keys;
use crate::store::{Assert, Document, DocumentStore, FieldAssert, Op, StoreError};
use crate::time::LogicalTime;

pub const FIELD_HOLDER: &str = "holder";
pub const FIELD_EXPIRY: &str = "expiry";

/// The persisted state of one namespace's leadership lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub expiry: LogicalTime,
}

impl Lease {
    /// Whether the lease has expired as of `now`. Expiry is inclusive: a
    /// lease whose deadline equals the current time is no longer held.
    pub fn expired(&self, now: LogicalTime) -> bool {
        self.expiry <= now
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(FIELD_HOLDER.into(), json!(self.holder));
        doc.insert(FIELD_EXPIRY.into(), json!(self.expiry.millis()));
        doc
    }

    pub fn from_document(doc: &Document) -> Option<Self> {
        let holder = doc.get(FIELD_HOLDER)?.as_str()?.to_string();
        let expiry = LogicalTime::from_millis(doc.get(FIELD_EXPIRY)?.as_u64()?);
        Some(Self { holder, expiry })
    }
}

fn held_by(holder: &str) -> Assert {
    Assert::Fields(vec![FieldAssert::Eq(FIELD_HOLDER.into(), json!(holder))])
}

fn held_by_and_expired(holder: &str, now: LogicalTime) -> Assert {
    Assert::Fields(vec![
        FieldAssert::Eq(FIELD_HOLDER.into(), json!(holder)),
        FieldAssert::LeqU64(FIELD_EXPIRY.into(), now.millis()),
    ])
}

/// Reads and conditional mutations over the lease documents in a store.
///
/// Stateless beyond the store handle; cheap to clone.
#[derive(Clone)]
pub struct LeaseStore {
    store: Arc<dyn DocumentStore>,
}

impl LeaseStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn read(&self, namespace: &str) -> Result<Option<Lease>, StoreError> {
        let doc = self.store.read(&keys::lease_key(namespace)).await?;
        Ok(doc.as_ref().and_then(Lease::from_document))
    }

    /// Every persisted lease, expired or not, keyed by namespace.
    pub async fn leases(&self) -> Result<BTreeMap<String, Lease>, StoreError> {
        let docs = self.store.read_prefix(keys::LEASE_PREFIX).await?;
        Ok(docs
            .iter()
            .filter_map(|(key, doc)| {
                let namespace = keys::namespace_of(key)?;
                Some((namespace.to_string(), Lease::from_document(doc)?))
            })
            .collect())
    }

    /// The current leader of every namespace with an unexpired lease.
    pub async fn application_leaders(
        &self,
        now: LogicalTime,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self
            .leases()
            .await?
            .into_iter()
            .filter(|(_, lease)| !lease.expired(now))
            .map(|(namespace, lease)| (namespace, lease.holder))
            .collect())
    }

    pub async fn apply(&self, ops: &[Op]) -> Result<(), StoreError> {
        self.store.atomic_apply(ops).await
    }

    /// Claim a vacant namespace: the lease document must not exist.
    pub fn claim_ops(namespace: &str, holder: &str, expiry: LogicalTime) -> Vec<Op> {
        let lease = Lease {
            holder: holder.to_string(),
            expiry,
        };
        vec![Op::put(
            keys::lease_key(namespace),
            Assert::Missing,
            lease.to_document(),
        )]
    }

    /// Extend the current holder's lease: the document must still name the
    /// same holder.
    pub fn extend_ops(namespace: &str, holder: &str, expiry: LogicalTime) -> Vec<Op> {
        let lease = Lease {
            holder: holder.to_string(),
            expiry,
        };
        vec![Op::put(
            keys::lease_key(namespace),
            held_by(holder),
            lease.to_document(),
        )]
    }

    /// Replace an expired lease with a new holder's: the document must
    /// still carry the previous holder and an expiry at or before `now`.
    pub fn takeover_ops(
        namespace: &str,
        previous_holder: &str,
        holder: &str,
        expiry: LogicalTime,
        now: LogicalTime,
    ) -> Vec<Op> {
        let lease = Lease {
            holder: holder.to_string(),
            expiry,
        };
        vec![Op::put(
            keys::lease_key(namespace),
            held_by_and_expired(previous_holder, now),
            lease.to_document(),
        )]
    }

    /// Remove a lease, but only if it is still expired as of `now`. A
    /// concurrent renewal that raced the expiry scan makes this abort.
    pub fn expire_ops(namespace: &str, holder: &str, now: LogicalTime) -> Vec<Op> {
        vec![Op::delete(
            keys::lease_key(namespace),
            held_by_and_expired(holder, now),
        )]
    }

    /// Assertion-only op stating that `holder` still holds the namespace's
    /// lease, for merging into an external transaction.
    pub fn check_op(namespace: &str, holder: &str) -> Op {
        Op::check(keys::lease_key(namespace), held_by(holder))
    }
}
