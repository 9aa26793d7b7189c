//! On-demand autograding portal with durable scheduled grading runs.
//!
//! Two binaries share this library: the portal itself (`ondemand`) and the
//! scheduler daemon (`ondemand-scheduler`), a separate process holding the
//! durable timer so pending triggers survive portal restarts.

pub mod daemon;
pub mod entities;
pub mod errors;
pub mod grading_api;
pub mod quota;
pub mod runs;
pub mod sched_api;
pub mod settings;
pub mod storage;
pub mod trigger;
pub mod web;
