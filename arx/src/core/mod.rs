//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests, and are
//! safe to invoke concurrently (no shared mutable state).

pub mod gate;
pub mod registry;
pub mod scorer;
pub mod template;
pub mod types;
pub mod workflow;
