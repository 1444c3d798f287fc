//! Purpose: Lock-free in-memory log buffer for intra-process message passing.
//! Exports: `api` (dispatcher surface) and `core` (partitions, framing, claims, subscriptions).
//! Role: Library backing the `dispatch-bench` binary and embedding applications.
//! Invariants: Producers never block consumers and consumers never block producers.
//! Invariants: Flow control is returned as values; `Error` is reserved for misuse and corruption.
pub mod api;
pub mod core;
