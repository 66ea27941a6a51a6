//! Shared-state coordinator for the Nexus orchestrator.
//!
//! The [`Blackboard`] projects sessions and tasks into a [`StateStore`],
//! hands out exclusive expiring claims ([`LeaseToken`]) and fans state
//! changes out to [`Subscription`]s. [`InMemoryStore`] serves a single
//! process; [`RedisStore`] lets workers in separate processes share sessions.
//! Any other key-value service with conditional writes and pub/sub can
//! implement [`StateStore`].

/// Session, task and claim operations.
pub mod blackboard;
/// Claim tokens.
pub mod lease;
/// Redis-backed store.
pub mod redis_store;
/// Deduplicating event subscription.
pub mod subscription;
/// Store wire contract and in-memory implementation.
pub mod store;

pub use blackboard::Blackboard;
pub use lease::LeaseToken;
pub use redis_store::RedisStore;
pub use store::{InMemoryStore, StateStore};
pub use subscription::Subscription;
