//! Pure data and rules shared by the agent.
//!
//! Nothing in `core` performs I/O: records decoded from the coordinator, the
//! job state machine, operation classification, and the typed errors other
//! modules downcast to.

pub mod errors;
pub mod job;
pub mod lifecycle;
pub mod types;
