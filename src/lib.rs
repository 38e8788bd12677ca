//! Leadership lease control plane.
//!
//! Grants, renews, verifies, and expires time-bounded leadership leases
//! with exactly-one-holder semantics, coordinated through a cluster-wide
//! logical clock persisted in a transactional document store.

pub mod facade;
pub mod keys;
pub mod leadership;
pub mod lease;
pub mod manager;
pub mod names;
pub mod settings;
pub mod store;
pub mod time;
pub mod trace;

pub use regent_macros::test;
