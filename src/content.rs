use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::models::{ContentId, ContentStatus, Count, ReportRow};

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn content_exists(&self, id: ContentId) -> Result<bool>;
    async fn report_count(&self, id: ContentId) -> Result<Count>;
    async fn increment_report_count(&self, id: ContentId) -> Result<Count>;
    async fn is_moderated(&self, id: ContentId) -> Result<bool>;
    async fn set_moderated(&self, id: ContentId, moderated: bool) -> Result<()>;
    async fn status(&self, id: ContentId) -> Result<ContentStatus>;
    /// Sets the status and returns the previous one.
    async fn set_status(&self, id: ContentId, status: ContentStatus) -> Result<ContentStatus>;
    /// Registers a visible comment. Returns false if it already existed.
    async fn register(&self, id: ContentId) -> Result<bool>;
    async fn list_reported(&self) -> Result<Vec<ReportRow>>;
}

#[derive(Debug, Clone)]
pub struct ContentRecord {
    pub report_count: Count,
    pub moderated: bool,
    pub status: ContentStatus,
}

impl Default for ContentRecord {
    fn default() -> Self {
        Self {
            report_count: 0,
            moderated: false,
            status: ContentStatus::Visible,
        }
    }
}

#[derive(Default)]
pub struct InMemoryContentStore {
    items: Mutex<HashMap<ContentId, ContentRecord>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: ContentId, record: ContentRecord) {
        self.items.lock().await.insert(id, record);
    }

    pub async fn record(&self, id: ContentId) -> Option<ContentRecord> {
        self.items.lock().await.get(&id).cloned()
    }

    async fn with_record<T>(
        &self,
        id: ContentId,
        f: impl FnOnce(&mut ContentRecord) -> T + Send,
    ) -> Result<T> {
        let mut guard = self.items.lock().await;
        let record = guard
            .get_mut(&id)
            .ok_or_else(|| anyhow!("comment {} does not exist", id))?;
        Ok(f(record))
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn content_exists(&self, id: ContentId) -> Result<bool> {
        Ok(self.items.lock().await.contains_key(&id))
    }

    async fn report_count(&self, id: ContentId) -> Result<Count> {
        self.with_record(id, |r| r.report_count).await
    }

    async fn increment_report_count(&self, id: ContentId) -> Result<Count> {
        self.with_record(id, |r| {
            r.report_count = r.report_count.saturating_add(1);
            r.report_count
        })
        .await
    }

    async fn is_moderated(&self, id: ContentId) -> Result<bool> {
        self.with_record(id, |r| r.moderated).await
    }

    async fn set_moderated(&self, id: ContentId, moderated: bool) -> Result<()> {
        self.with_record(id, |r| r.moderated = moderated).await
    }

    async fn status(&self, id: ContentId) -> Result<ContentStatus> {
        self.with_record(id, |r| r.status).await
    }

    async fn set_status(&self, id: ContentId, status: ContentStatus) -> Result<ContentStatus> {
        self.with_record(id, |r| std::mem::replace(&mut r.status, status))
            .await
    }

    async fn register(&self, id: ContentId) -> Result<bool> {
        let mut guard = self.items.lock().await;
        if guard.contains_key(&id) {
            return Ok(false);
        }
        guard.insert(id, ContentRecord::default());
        Ok(true)
    }

    async fn list_reported(&self) -> Result<Vec<ReportRow>> {
        let guard = self.items.lock().await;
        let mut rows: Vec<ReportRow> = guard
            .iter()
            .filter(|(_, r)| r.report_count > 0)
            .map(|(id, r)| ReportRow {
                content_id: *id,
                report_count: r.report_count,
                status: r.status,
                moderated: r.moderated,
            })
            .collect();
        rows.sort_by_key(|row| row.content_id);
        Ok(rows)
    }
}
