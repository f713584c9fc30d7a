//! Run-execution agent.
//!
//! The agent discovers pending runs through a [`listener`], hands each one to
//! the [`agent`] orchestrator and executes it with a pluggable [`driver`]
//! backend. Lifecycle events fan out through the [`bus`]; executing jobs report
//! back through the callback [`server`], guarded by per-run tokens from
//! [`auth`].
//!
//! - **[`core`]**: Plain data and rules (runs, jobs, lifecycle). No I/O.
//! - **[`io`]**: Configuration, the coordinator client, archives and processes.

pub mod agent;
pub mod auth;
pub mod bus;
pub mod core;
pub mod driver;
pub mod exit_codes;
pub mod io;
pub mod listener;
pub mod logging;
pub mod server;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
