//! Asset-management platforms.

pub mod armis;

pub use armis::{ArmisConfig, ArmisIntegration};
