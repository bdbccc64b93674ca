//! CLI command implementations.

pub mod inspect_rows;
pub mod simulate;
