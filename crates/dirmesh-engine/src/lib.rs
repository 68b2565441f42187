#![warn(missing_docs)]

//! DirMesh replication engine.
//!
//! The engine runs on every server. It keeps a registry of replicated
//! partitions and their partner sessions, queues pulls and notifies with
//! coalescing, drives the pull cycle and change notification against
//! partner servers, and ties the whole loop to periodic timers for
//! topology recomputation, the operation pump, and maintenance sweeps.

pub mod engine;
pub mod notify;
pub mod opqueue;
pub mod pull;
pub mod registry;
pub mod testing;
pub mod triggers;
