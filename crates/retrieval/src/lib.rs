//! Retrieval side of the Arbiter pipeline.
//!
//! Three stages run before the reasoning loop sees a query:
//!
//! 1. **Router** — classifies the query into a retrieval strategy and the
//!    partitions to search ([`router`]).
//! 2. **Fan-out** — searches the chosen partitions concurrently, degrading
//!    gracefully when a partition is down ([`fanout`]).
//! 3. **Resolver** — reconciles contradictory hits pooled from two or more
//!    partitions ([`resolver`]).
//!
//! The [`memory`] module provides an in-memory [`PartitionClient`]
//! implementation for tests and demos.
//!
//! [`PartitionClient`]: arbiter_core::PartitionClient

pub mod fanout;
pub mod memory;
pub mod resolver;
pub mod router;

pub use fanout::{RetrievalPool, search_partitions};
pub use memory::InMemoryPartitions;
pub use resolver::{ConflictKind, ConflictReport, ConflictResolver, ConflictStats};
pub use router::{QueryRouter, QuerySignals, Route, RetrievalStrategy};
