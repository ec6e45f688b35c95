//! Utilities: clock, shared identifiers and enums, telemetry.

pub mod clock;
pub mod serde;
pub mod telemetry;

pub use clock::*;
pub use serde::*;
pub use telemetry::*;
