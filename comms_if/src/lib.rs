//! # Communications interface crate.
//!
//! Provides all common communications interfaces for the elevation mapping software.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Sensor stream messages (poses, point clouds, transforms)
pub mod sens;

/// Map publication messages and map service commands/responses
pub mod map;

/// Network module
pub mod net;
