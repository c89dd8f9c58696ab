//! Node selection (load balancing).
//!
//! [`NodeSelector`] supports round-robin, least-connections, weighted
//! round-robin, hash-based, resource-fit and multi-factor strategies. All of
//! them ignore nodes that are not healthy or degraded.

pub mod selector;

pub use selector::NodeSelector;
