//! # Project Tests
//!
//! Workspace-level scenario tests for `lib_peer`. The scenarios live under
//! `tests/` and drive a booted engine over the in-memory transports of
//! `lib_peer::testing`.
