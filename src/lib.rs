//! Purpose: Stream stored JSON documents from query cursors into byte sinks.
//! Exports: `api` (stable surface) and `core` (copier, streamer, cursor boundary, errors).
//! Role: Library backing the `docstream` CLI and HTTP server.
//! Invariants: Documents are relayed byte-for-byte apart from a leading sentinel byte.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
