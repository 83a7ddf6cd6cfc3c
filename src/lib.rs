//! Incremental note indexing and on-device semantic search.
//!
//! Notes are split into size-bounded chunks, embedded off the async threads
//! and stored with their vectors. Queries are embedded the same way, ranked
//! by dot product and returned with highlighted snippets.

pub mod chunking;
pub mod cli;
pub mod config;
pub mod eid;
pub mod embedding;
pub mod engine;
pub mod indexer;
pub mod search;
pub mod storage;
pub mod store;

#[cfg(test)]
mod tests;
