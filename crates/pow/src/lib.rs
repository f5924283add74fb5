//! Compact targets, chain work, difficulty retargeting, and proof-of-work checks.

pub mod difficulty;
pub mod validation;
