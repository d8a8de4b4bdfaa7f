//! # Map Publisher
//!
//! Output channels for the map products.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};

use crate::map::GridMap;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Sink for the map products. Implementations must be safe to call from several threads.
pub trait MapPublisher: Send + Sync {
    /// Publish the complete map on the raw channel.
    fn publish_raw(&self, map: &GridMap, timestamp: DateTime<Utc>) -> Result<(), PublishError>;

    /// Publish a (reduced) map on the recordable channel.
    fn publish_recordable(&self, map: &GridMap) -> Result<(), PublishError>;

    /// Publish the map projected into points.
    fn publish_points(
        &self,
        frame_id: &str,
        timestamp: DateTime<Utc>,
        points: &[[f32; 3]],
    ) -> Result<(), PublishError>;

    /// Publish a heartbeat.
    fn publish_alive(&self) -> Result<(), PublishError>;
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Could not serialize the message: {0}")]
    SerializationError(serde_json::Error),

    #[error("Could not send the message: {0}")]
    TransportError(String),
}
