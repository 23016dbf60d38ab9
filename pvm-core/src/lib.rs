//! Process virtual machine core.
//!
//! Interprets a deployed [`graph::ProcessGraph`] as a tree of executions,
//! walks tokens synchronously to wait-states or async boundaries, and resumes
//! them later through the command stack or the [`jobexecutor::JobExecutor`].
//! All persistence goes through [`store::PersistenceSession`].

pub mod clock;
pub mod command;
pub mod config;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod expression;
pub mod graph;
pub mod handler;
pub mod job;
pub mod jobexecutor;
pub mod pvm;
pub mod session;
pub mod store;
pub mod types;
pub mod variables;

pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::{EngineError, EntityKind, StoreError};
