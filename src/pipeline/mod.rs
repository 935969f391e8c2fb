//! The per-session request pipeline: in-flight coalescing (dedup), read
//! merging, and write batching. All three rest on the same idea — a result
//! shared by many callers where a caller's timeout detaches that caller
//! without cancelling the shared work.

pub mod batch;
pub mod dedup;
pub mod flight;
pub mod merge;

pub use batch::WriteBatcher;
pub use dedup::Deduplicator;
pub use flight::FlightMap;
pub use merge::ReadMerger;
