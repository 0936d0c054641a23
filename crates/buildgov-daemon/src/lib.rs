//! The build governor daemon.
//!
//! `buildgovd` is the long-running process that owns the token pool. Shims
//! connect to its Unix-domain endpoint, speak LF-delimited JSON, and the
//! daemon answers `acquire`, `release`, `status`, and `heartbeat`, one
//! reply per request, in order, per connection.
//!
//! Structure:
//!
//! - [`config`]: startup configuration from environment overrides.
//! - [`instance`]: the "at most one governor per host" flock discipline.
//! - [`server`]: listener and per-connection tasks.
//! - [`dispatch`]: wire line → pool call → wire line.
//! - [`maintenance`]: the 500 ms sweep and background-mode idle shutdown.
//!
//! All shared mutation goes through the pool's lock; connection tasks never
//! hold it across I/O. Leases are keyed by id, not by connection, so a
//! dropped connection leaves its leases to the TTL sweep.

pub mod config;
pub mod dispatch;
pub mod instance;
pub mod maintenance;
pub mod server;
