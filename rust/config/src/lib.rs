//! Configuration types shared between ailab crates.

mod settings;
mod types;

pub use settings::*;
pub use types::*;
