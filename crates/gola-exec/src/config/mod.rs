//! Service configuration: YAML types, defaults, validation and loading.

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::*;
