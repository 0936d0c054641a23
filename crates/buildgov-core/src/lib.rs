//! Core admission-control runtime for the build governor.
//!
//! The governor prevents memory exhaustion during massively parallel C++
//! builds by mediating every compiler and linker invocation through a token
//! pool whose capacity tracks host commit pressure. This crate holds the
//! pieces shared between the governor daemon, the tool shims, and the
//! operator CLI:
//!
//! - [`memory`]: host-wide commit accounting snapshots and the probe that
//!   produces them, plus per-child memory sampling for the shims.
//! - [`budget`]: the pure function that turns a memory snapshot into a token
//!   capacity and a throttle level.
//! - [`pool`]: the token pool and lease manager: grant, release, TTL
//!   reclamation, status.
//! - [`classify`]: the post-exit failure classifier that distinguishes
//!   ordinary compile errors from likely OOM kills.
//! - [`protocol`]: the LF-delimited JSON wire messages spoken between shims
//!   and the daemon, and the stable endpoint/lock naming.
//! - [`lockfile`]: `flock(2)` helpers backing the single-instance and
//!   launcher-election discipline.
//!
//! # Architecture
//!
//! ```text
//! shim ──acquire──▶ pool ◀──sample── memory probe
//!   │                 │
//!   │               budget (recomputed every tick and on every request)
//!   │                 │
//! shim ──release──▶ pool ──▶ classifier ──▶ advice back to the shim
//! ```
//!
//! Everything here is in-memory; the governor persists nothing and a fresh
//! process starts with a fresh lease table.

pub mod budget;
pub mod classify;
pub mod lockfile;
pub mod memory;
pub mod pool;
pub mod protocol;
