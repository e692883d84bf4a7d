//! Tracing bootstrap for Argos binaries and tests.

mod tracing;

pub use crate::tracing::{init, try_init};
