//! Stable exit codes for agent CLI commands.

/// Run finished `done`, or the command succeeded.
pub const OK: i32 = 0;
/// Run finished `failed` (error decision, fatal tool condition, exhausted
/// budget) or the command hit a runtime error.
pub const FAILED: i32 = 1;
/// Configuration or input was invalid before any work started.
pub const INVALID: i32 = 2;
