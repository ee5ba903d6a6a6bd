//! nettune-daemon - the HTTP control surface over `nettune-core`.
//!
//! The daemon is a replaceable shell: every endpoint decodes a request,
//! bridges onto the core engine via `spawn_blocking` (core operations do
//! blocking I/O and run external tools), and encodes the
//! `{success, data?, error?}` envelope back out. Requests pass the per-IP
//! rate limiter first, then constant-time bearer authentication.

#![warn(clippy::all)]

pub mod api;
pub mod state;
