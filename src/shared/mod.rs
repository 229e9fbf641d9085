//! Shared utilities used across layers.

pub mod background;
pub mod error;
