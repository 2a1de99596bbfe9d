use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::content::ContentStore;
use crate::models::{ContentId, ContentStatus, Count};

pub fn threshold_reached(report_count: Count, threshold: i64) -> bool {
    // A non-positive threshold is a misconfiguration; it still holds.
    i64::try_from(report_count).map_or(true, |count| count >= threshold)
}

#[derive(Clone)]
pub struct ModerationGate {
    content: Arc<dyn ContentStore>,
}

impl ModerationGate {
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self { content }
    }

    /// Holding content that is already held is a no-op.
    pub async fn hold(&self, id: ContentId) -> Result<bool> {
        let previous = self.content.set_status(id, ContentStatus::Held).await?;
        if previous == ContentStatus::Held {
            debug!(comment_id = %id, "comment already held");
            return Ok(false);
        }
        info!(comment_id = %id, "comment held for moderation");
        Ok(true)
    }

    /// Administrator approval: back to visible and remembered as reviewed so
    /// later reports stop re-holding it.
    pub async fn release(&self, id: ContentId) -> Result<()> {
        self.content.set_status(id, ContentStatus::Visible).await?;
        self.content.set_moderated(id, true).await?;
        info!(comment_id = %id, "comment released by moderator");
        Ok(())
    }
}
