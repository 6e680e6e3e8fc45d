//! Tool-calling agent runtime for editing Shopify theme workspaces.
//!
//! A model is driven through iterations of tool calls until it declares the
//! task done, asks a human for admin-only steps, or fails. Every capability it
//! can use is sandboxed: commands against an allow-list, file access confined
//! to the theme's top-level directories, and edits expressed as validated
//! plans applied with anchor and hunk preconditions.
//!
//! - **[`core`]**: Pure, deterministic logic (paths, plans, diffs, anchors,
//!   decisions). No I/O.
//! - **[`io`]**: Side-effecting capabilities (processes, files, model client,
//!   JSON-RPC bridges, verification, run artifacts).
//! - **[`tools`]**: The tool registry and one handler per capability.
//!
//! Orchestration modules ([`tool_loop`], [`run`], [`session`]) coordinate the
//! above to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod observer;
pub mod run;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tool_loop;
pub mod tools;
