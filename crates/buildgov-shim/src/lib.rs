//! Tool shims for the build governor.
//!
//! A shim impersonates a real build tool on PATH. Per invocation it locates
//! the real tool, estimates a token cost from the command line, leases
//! tokens from the governor (auto-starting one if needed), runs the real
//! tool with its memory sampled at ~10 Hz, releases the lease with what it
//! observed, and exits with the tool's own exit code.
//!
//! The one inviolable rule is fall-open: if the governor is absent,
//! crashed, or slow, the shim runs the real tool ungoverned after a single
//! warning. The governor must never become a build blocker.
//!
//! Two shims exist, [`profile::ToolProfile::cl`] and
//! [`profile::ToolProfile::link`], differing only in the real tool they
//! locate, the cost estimator, and the stderr diagnostic predicate.

pub mod client;
pub mod cmdline;
pub mod locate;
pub mod profile;
pub mod run;
pub mod sampler;
pub mod stderr;
