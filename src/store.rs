//! Document store boundary for the lease core.
//!
//! Every lease mutation in this crate is expressed as a batch of
//! conditional document operations ([`Op`]) committed through
//! [`DocumentStore::atomic_apply`]. The batch either commits as a whole or
//! aborts without side effects, which is the system's sole mutual-exclusion
//! mechanism: multiple controller processes race for the same leases, so an
//! in-process mutex can never substitute for store-level atomicity.
//!
//! [`MemStore`] is the in-memory backend used by tests and single-node
//! deployments. Production deployments plug in a remote transactional
//! document store behind the same trait.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

/// A store document: a flat JSON object.
pub type Document = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// An assertion in the batch did not hold; nothing was applied.
    #[error("transaction aborted: an assertion did not hold")]
    Aborted,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One conditional document operation.
#[derive(Debug, Clone)]
pub struct Op {
    pub key: String,
    pub assert: Assert,
    pub mutate: Mutate,
}

impl Op {
    /// An assertion-only op, for merging a precondition into a larger batch.
    pub fn check(key: impl Into<String>, assert: Assert) -> Self {
        Self {
            key: key.into(),
            assert,
            mutate: Mutate::None,
        }
    }

    pub fn put(key: impl Into<String>, assert: Assert, doc: Document) -> Self {
        Self {
            key: key.into(),
            assert,
            mutate: Mutate::Put(doc),
        }
    }

    pub fn delete(key: impl Into<String>, assert: Assert) -> Self {
        Self {
            key: key.into(),
            assert,
            mutate: Mutate::Delete,
        }
    }
}

/// Precondition on the document at an op's key.
#[derive(Debug, Clone)]
pub enum Assert {
    Anything,
    Missing,
    Exists,
    /// All field assertions must hold; fails if the document is missing.
    Fields(Vec<FieldAssert>),
}

#[derive(Debug, Clone)]
pub enum FieldAssert {
    /// Field is present and equal to the given value.
    Eq(String, Value),
    /// Field is present, numeric, and at most the given bound.
    LeqU64(String, u64),
}

/// Mutation to apply once the whole batch's assertions hold.
#[derive(Debug, Clone)]
pub enum Mutate {
    None,
    Put(Document),
    Delete,
}

/// Transactional document store boundary.
///
/// Assertions are evaluated against the state visible at the start of the
/// batch; mutations are applied in batch order only if every assertion
/// holds. Implementations must be safe for concurrent use.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn atomic_apply(&self, ops: &[Op]) -> Result<(), StoreError>;
    async fn read(&self, key: &str) -> Result<Option<Document>, StoreError>;
    async fn read_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Document>, StoreError>;
}

/// In-memory [`DocumentStore`] backend.
#[derive(Default)]
pub struct MemStore {
    docs: Mutex<BTreeMap<String, Document>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn assert_holds(doc: Option<&Document>, assert: &Assert) -> bool {
    match assert {
        Assert::Anything => true,
        Assert::Missing => doc.is_none(),
        Assert::Exists => doc.is_some(),
        Assert::Fields(fields) => match doc {
            None => false,
            Some(doc) => fields.iter().all(|f| field_holds(doc, f)),
        },
    }
}

fn field_holds(doc: &Document, assert: &FieldAssert) -> bool {
    match assert {
        FieldAssert::Eq(field, expected) => doc.get(field) == Some(expected),
        FieldAssert::LeqU64(field, bound) => doc
            .get(field)
            .and_then(Value::as_u64)
            .is_some_and(|v| v <= *bound),
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn atomic_apply(&self, ops: &[Op]) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().expect("store mutex poisoned");
        for op in ops {
            if !assert_holds(docs.get(&op.key), &op.assert) {
                return Err(StoreError::Aborted);
            }
        }
        for op in ops {
            match &op.mutate {
                Mutate::None => {}
                Mutate::Put(doc) => {
                    docs.insert(op.key.clone(), doc.clone());
                }
                Mutate::Delete => {
                    docs.remove(&op.key);
                }
            }
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Document>, StoreError> {
        let docs = self.docs.lock().expect("store mutex poisoned");
        Ok(docs.get(key).cloned())
    }

    async fn read_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Document>, StoreError> {
        let docs = self.docs.lock().expect("store mutex poisoned");
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn put_then_read() {
        let store = MemStore::new();
        let d = doc(&[("holder", json!("application/0"))]);
        store
            .atomic_apply(&[Op::put("lease/application", Assert::Missing, d.clone())])
            .await
            .unwrap();
        assert_eq!(store.read("lease/application").await.unwrap(), Some(d));
    }

    #[tokio::test]
    async fn failed_assertion_aborts_whole_batch() {
        let store = MemStore::new();
        let result = store
            .atomic_apply(&[
                Op::put("a", Assert::Missing, doc(&[("x", json!(1))])),
                Op::put("b", Assert::Exists, doc(&[("x", json!(2))])),
            ])
            .await;
        assert!(matches!(result, Err(StoreError::Aborted)));
        // The first op must not have been applied.
        assert_eq!(store.read("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn field_assertions() {
        let store = MemStore::new();
        let d = doc(&[("holder", json!("blah/0")), ("expiry", json!(500u64))]);
        store
            .atomic_apply(&[Op::put("lease/blah", Assert::Missing, d)])
            .await
            .unwrap();

        let held_by = |holder: &str| {
            Assert::Fields(vec![FieldAssert::Eq("holder".into(), json!(holder))])
        };
        store
            .atomic_apply(&[Op::check("lease/blah", held_by("blah/0"))])
            .await
            .unwrap();
        assert!(matches!(
            store
                .atomic_apply(&[Op::check("lease/blah", held_by("blah/1"))])
                .await,
            Err(StoreError::Aborted)
        ));

        let expired_by = |bound: u64| {
            Assert::Fields(vec![FieldAssert::LeqU64("expiry".into(), bound)])
        };
        store
            .atomic_apply(&[Op::check("lease/blah", expired_by(500))])
            .await
            .unwrap();
        assert!(matches!(
            store
                .atomic_apply(&[Op::check("lease/blah", expired_by(499))])
                .await,
            Err(StoreError::Aborted)
        ));
    }

    #[tokio::test]
    async fn fields_assertion_fails_on_missing_document() {
        let store = MemStore::new();
        let assert = Assert::Fields(vec![FieldAssert::Eq("holder".into(), json!("x/0"))]);
        assert!(matches!(
            store.atomic_apply(&[Op::check("lease/x", assert)]).await,
            Err(StoreError::Aborted)
        ));
    }

    #[tokio::test]
    async fn conditional_delete() {
        let store = MemStore::new();
        store
            .atomic_apply(&[Op::put(
                "lease/app",
                Assert::Missing,
                doc(&[("expiry", json!(10u64))]),
            )])
            .await
            .unwrap();
        store
            .atomic_apply(&[Op::delete(
                "lease/app",
                Assert::Fields(vec![FieldAssert::LeqU64("expiry".into(), 10)]),
            )])
            .await
            .unwrap();
        assert_eq!(store.read("lease/app").await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_prefix_scans_only_matching_keys() {
        let store = MemStore::new();
        for key in ["lease/a", "lease/b", "clock/global"] {
            store
                .atomic_apply(&[Op::put(key, Assert::Missing, Document::new())])
                .await
                .unwrap();
        }
        let leases = store.read_prefix("lease/").await.unwrap();
        assert_eq!(
            leases.keys().collect::<Vec<_>>(),
            vec!["lease/a", "lease/b"]
        );
    }
}
