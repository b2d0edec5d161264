//! Version information for pacer.

/// Pacer version from Cargo.toml
pub const PACER_VERSION: &str = env!("CARGO_PKG_VERSION");
