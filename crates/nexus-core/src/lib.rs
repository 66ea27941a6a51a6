//! Core types and error definitions for the Nexus task orchestrator.
//!
//! This crate provides the foundational types shared across all Nexus crates:
//! the error taxonomy, the task and session data model, and the event
//! envelope published on session notification channels.
//!
//! # Main types
//!
//! - [`NexusError`] — Unified error enum for all Nexus subsystems.
//! - [`NexusResult`] — Convenience alias for `Result<T, NexusError>`.
//! - [`Task`] — A unit of work with dependencies and a lifecycle status.
//! - [`Session`] — One orchestration run and its task projection.
//! - [`TaskEvent`] — State-change notification envelope.

/// Error taxonomy.
pub mod error;
/// State-change event envelope.
pub mod event;
/// Session model.
pub mod session;
/// Task model.
pub mod task;

pub use error::{NexusError, NexusResult};
pub use event::{EventKind, TaskEvent};
pub use session::{Session, SessionStatus};
pub use task::{Task, TaskStatus, TaskType};
