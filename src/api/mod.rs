//! Purpose: Define the stable public Rust API boundary for docstream.
//! Exports: Streaming primitives, connection-level helpers, and the directory store.
//! Role: Public, additive-only surface used by the CLI, the server, and embedders.
//! Invariants: This module is the only public path to the streaming primitives.
//! Invariants: Output bytes are relayed, never parsed, except through `load_one`.

mod directory;
mod query;

pub use crate::core::cancel::CancelToken;
pub use crate::core::cursor::{DEFAULT_PAYLOAD_COLUMN, RowCursor, RowShape};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::memory::{MemoryCursor, MemoryPayload, MemoryRow};
pub use crate::core::sentinel::{DEFAULT_CHUNK_SIZE, SENTINEL, copy_payload};
pub use crate::core::stream::{JsonStreamer, StreamOptions};
pub use directory::{DirPayload, DirectoryCursor, DirectoryStore, DocQuery};
pub use query::{
    Connection, JsonSelector, Selector, load_one, stream_many_query, stream_one_query,
};
