//! Deterministic, pure logic shared by the agent.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (plans, diffs, file text, model replies) and return deterministic
//! outputs suitable for tests.

pub mod anchor;
pub mod decision;
pub mod diff;
pub mod path;
pub mod plan;
pub mod types;
