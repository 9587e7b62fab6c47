//! Test utilities for the load generator.
//!
//! This crate provides an in-process stub object store to run loads against, and a tracing
//! setup for tests. See the modules for all available utilities.

pub mod server;
pub mod tracing;
