#![warn(missing_docs)]

//! DirMesh end-to-end suites.
//!
//! The integration modules drive the topology scheduler and the
//! replication engine over in-memory directories with scripted
//! transports; the property module checks cross-crate invariants on
//! randomized site graphs. [`harness`] holds the shared fixture
//! builders.

pub mod harness;

#[cfg(test)]
mod engine_integration;
#[cfg(test)]
mod proptest_topology;
#[cfg(test)]
mod topology_integration;
