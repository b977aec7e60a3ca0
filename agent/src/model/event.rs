//! Events passed between workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted by the image watcher when a tracked image tag advances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUpdateEvent {
    /// Name of the image provider that observed the change
    pub provider: String,

    /// Image repository, e.g. `org/web`
    pub image: String,

    /// The new tag
    pub tag: String,

    /// Digest recorded for the new tag
    pub digest: String,

    /// Applications referencing this image
    pub application_ids: Vec<String>,

    pub observed_at: DateTime<Utc>,
}
