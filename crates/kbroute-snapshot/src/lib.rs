//! kbroute-snapshot
//!
//! On-disk LanceDB snapshot of indexed chunks. `SnapshotWriter` fills it,
//! `SnapshotIndex` serves it as the local vector tier.
#![deny(warnings)]
#![deny(dead_code, unused_variables, unused_imports)]

pub mod index;
pub mod schema;
pub mod table;
pub mod writer;

pub use index::SnapshotIndex;
pub use writer::SnapshotWriter;
