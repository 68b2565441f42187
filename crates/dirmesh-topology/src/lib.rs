#![warn(missing_docs)]

//! DirMesh inter-site topology computation.
//!
//! Once per period, for every replicated partition, the scheduler builds
//! a graph of sites and links, colors vertices by replica presence, grows
//! shortest-path forests per transport, extracts inter-tree edges, spans
//! them with a minimum-cost tree, and materializes the tree edges that
//! touch the local site into connection objects.

pub mod bridgehead;
pub mod coloring;
pub mod forest;
pub mod graph;
pub mod materialize;
pub mod scheduler;
pub mod spanning;
