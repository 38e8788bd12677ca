//! Key builders for the documents the lease core keeps in the store.
//!
//! Keeping every key format in one place makes it possible to audit the
//! store layout at a glance and keeps prefix scans consistent with writes.

/// Prefix under which all lease documents live.
pub const LEASE_PREFIX: &str = "lease/";

/// Key of the lease document for a namespace.
pub fn lease_key(namespace: &str) -> String {
    format!("{LEASE_PREFIX}{namespace}")
}

/// Inverse of [`lease_key`]: extract the namespace from a lease document key.
pub fn namespace_of(key: &str) -> Option<&str> {
    key.strip_prefix(LEASE_PREFIX)
}

/// Key of the single cluster-wide clock document.
pub fn global_clock_key() -> &'static str {
    "clock/global"
}
