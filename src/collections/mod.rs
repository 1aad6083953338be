//! Small collection helpers shared by the routing components.
//!
//! All routing tables are keyed by strings (endpoints, agency ids,
//! task ids), so we default to a faster non-cryptographic hasher than
//! the standard library's `SipHash` for these hot-path lookups.

use std::collections::HashMap as StdHashMap;

#[cfg(feature = "collections_randomstate_twox_hash")]
pub type RandomState = twox_hash::RandomXxHashBuilder64;

#[cfg(not(feature = "collections_randomstate_twox_hash"))]
pub type RandomState = std::collections::hash_map::RandomState;

/// A `HashMap` keyed by the crate's default hasher.
pub type HashMap<K, V> = StdHashMap<K, V, RandomState>;

pub fn new_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}
