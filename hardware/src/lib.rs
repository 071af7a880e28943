//! Hardware drivers for the eyepiece servo equipment.
//!
//! Each driver is feature-gated for optional compilation.
//!
//! # Features
//!
//! ## Individual Drivers
//! - `hx35` - Hiwonder HX-35 serial bus servos (focuser / zoom eyepiece)
//!
//! ## Convenience Features
//! - `ci-testable` - Drivers with unit tests runnable in CI (no hardware needed)

#[cfg(feature = "hx35")]
pub mod hiwonder;
