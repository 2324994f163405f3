//! Shared helpers for the StrataDB benchmarks.

pub mod utils;
