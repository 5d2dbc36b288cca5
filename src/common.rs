//! Common definitions that are shared between different parts of the compiler.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers: interned strings, cheap to copy and compare.
pub type Id = internment::Intern<String>;

/// Intern a string slice.
pub fn id(s: &str) -> Id {
    Id::from_ref(s)
}

/// Round a byte count up to the next multiple of 8.
pub fn round8(n: i64) -> i64 {
    (n + 7) & !7
}
