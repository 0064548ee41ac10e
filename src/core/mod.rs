// Core modules implementing payload copying, cursor streaming, and error modeling.
pub mod cancel;
pub mod cursor;
pub mod error;
pub mod memory;
pub mod sentinel;
pub mod stream;
