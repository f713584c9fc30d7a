//! Stable exit codes for `run-agent` commands.

/// Command succeeded, or the listener shut down cleanly.
pub const OK: i32 = 0;
/// Invalid configuration, unreachable dependency or any other startup error.
pub const INVALID: i32 = 1;
