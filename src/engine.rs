use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::content::ContentStore;
use crate::error::FlagError;
use crate::marker::{self, ReportMap};
use crate::moderation::{threshold_reached, ModerationGate};
use crate::models::{ContentId, Count, RequestContext};
use crate::settings::SettingsProvider;
use crate::window::{window_key, WindowStore, DEFAULT_NAMESPACE};

pub const DEFAULT_GRACE: Count = 3;
pub const DEFAULT_MARKER_TTL_SECS: i64 = 7 * 24 * 60 * 60;
pub const DEFAULT_WINDOW_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub namespace: String,
    pub grace: Count,
    pub marker_ttl: Duration,
    pub window_ttl: Duration,
    pub allow_reflag_moderated: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            grace: DEFAULT_GRACE,
            marker_ttl: Duration::seconds(DEFAULT_MARKER_TTL_SECS),
            window_ttl: Duration::seconds(DEFAULT_WINDOW_TTL_SECS),
            allow_reflag_moderated: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Messages {
    pub thank_you: String,
    pub invalid_nonce: String,
    pub invalid_values: String,
    pub already_flagged: String,
    pub disabled: String,
    pub unavailable: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            thank_you: "Thank you for your feedback. We will look into it.".to_string(),
            invalid_nonce: "It seems you already reported this comment.".to_string(),
            invalid_values: "Cheating huh?".to_string(),
            already_flagged: "It seems you already reported this comment.".to_string(),
            disabled: "Comment flagging is disabled.".to_string(),
            unavailable: "Your report could not be processed right now.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted(String),
    AlreadyFlagged(String),
    RejectedInvalid(String),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted(_) => "accepted",
            Outcome::AlreadyFlagged(_) => "already_flagged",
            Outcome::RejectedInvalid(_) => "rejected",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Accepted(m) | Outcome::AlreadyFlagged(m) | Outcome::RejectedInvalid(m) => m,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerWrite {
    pub value: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub outcome: Outcome,
    pub marker: Option<MarkerWrite>,
}

impl Submission {
    fn without_marker(outcome: Outcome) -> Self {
        Self {
            outcome,
            marker: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarkReport {
    pub report_count: Count,
    pub marker: MarkerWrite,
    pub held: bool,
    pub suppressed: bool,
}

#[async_trait]
pub trait FlagNotifier: Send + Sync {
    async fn content_flagged(&self, id: ContentId);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl FlagNotifier for TracingNotifier {
    async fn content_flagged(&self, id: ContentId) {
        info!(comment_id = %id, "comment flagged for moderation");
    }
}

#[derive(Clone)]
pub struct FlagEngine {
    content: Arc<dyn ContentStore>,
    settings: Arc<dyn SettingsProvider>,
    window: Arc<dyn WindowStore>,
    notifier: Arc<dyn FlagNotifier>,
    gate: ModerationGate,
    config: EngineConfig,
    messages: Arc<Messages>,
}

impl FlagEngine {
    pub fn new(
        content: Arc<dyn ContentStore>,
        settings: Arc<dyn SettingsProvider>,
        window: Arc<dyn WindowStore>,
        notifier: Arc<dyn FlagNotifier>,
        config: EngineConfig,
    ) -> Self {
        let gate = ModerationGate::new(content.clone());
        Self {
            content,
            settings,
            window,
            notifier,
            gate,
            config,
            messages: Arc::new(Messages::default()),
        }
    }

    pub fn with_messages(mut self, messages: Messages) -> Self {
        self.messages = Arc::new(messages);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    pub fn gate(&self) -> &ModerationGate {
        &self.gate
    }

    fn window_key(&self, ctx: &RequestContext) -> String {
        window_key(&self.config.namespace, &ctx.client_address)
    }

    fn client_marker(&self, ctx: &RequestContext) -> ReportMap {
        if !ctx.capability_probe {
            return ReportMap::new();
        }
        ctx.marker.as_deref().map(marker::decode).unwrap_or_default()
    }

    pub async fn check_already_flagged(&self, id: ContentId, ctx: &RequestContext) -> Result<bool> {
        if ctx.capability_probe && ctx.marker.is_some() && self.client_marker(ctx).contains(id) {
            debug!(comment_id = %id, "client marker already holds comment");
            return Ok(true);
        }

        let Some(window) = self.window.get(&self.window_key(ctx)).await? else {
            return Ok(false);
        };
        let count = window.count(id);
        if !ctx.capability_probe && count >= 1 {
            debug!(comment_id = %id, count, "address already reported comment without cookies");
            return Ok(true);
        }
        if ctx.capability_probe && count >= self.config.grace {
            warn!(
                comment_id = %id,
                count,
                grace = self.config.grace,
                "address keeps reporting with a clean marker"
            );
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn mark_flagged(&self, id: ContentId, ctx: &RequestContext) -> Result<MarkReport> {
        let mut reports = self.client_marker(ctx);
        reports.increment(id);
        let marker = MarkerWrite {
            value: marker::encode(&reports),
            ttl: self.config.marker_ttl,
        };

        self.window
            .increment(&self.window_key(ctx), id, self.config.window_ttl)
            .await?;

        self.content.increment_report_count(id).await?;

        let report_count = self.content.report_count(id).await?;
        let moderated = self.content.is_moderated(id).await?;
        if report_count > 0 && moderated && !self.config.allow_reflag_moderated {
            info!(comment_id = %id, report_count, "report counted on moderated comment, not re-holding");
            return Ok(MarkReport {
                report_count,
                marker,
                held: false,
                suppressed: true,
            });
        }

        let threshold = self.settings.threshold().await?;
        let mut held = false;
        if threshold_reached(report_count, threshold) {
            held = self.gate.hold(id).await?;
            self.notifier.content_flagged(id).await;
        }

        Ok(MarkReport {
            report_count,
            marker,
            held,
            suppressed: false,
        })
    }

    pub async fn status(&self, id: ContentId, ctx: &RequestContext) -> Result<bool> {
        self.check_already_flagged(id, ctx).await
    }

    async fn try_submit(&self, raw_id: Option<&str>, ctx: &RequestContext) -> Result<MarkReport, FlagError> {
        if !self.settings.is_enabled().await? {
            return Err(FlagError::Disabled);
        }
        let raw_id = raw_id.ok_or_else(|| FlagError::InvalidInput("missing comment id".to_string()))?;
        let id = ContentId::parse(raw_id)
            .ok_or_else(|| FlagError::InvalidInput(format!("malformed comment id {raw_id:?}")))?;
        if !self.content.content_exists(id).await? {
            return Err(FlagError::InvalidInput(format!("comment {id} does not exist")));
        }
        if self.check_already_flagged(id, ctx).await? {
            return Err(FlagError::DuplicateReport(id));
        }
        Ok(self.mark_flagged(id, ctx).await?)
    }

    pub async fn submit_report(&self, raw_id: Option<&str>, ctx: &RequestContext) -> Submission {
        match self.try_submit(raw_id, ctx).await {
            Ok(report) => {
                info!(
                    report_count = report.report_count,
                    held = report.held,
                    suppressed = report.suppressed,
                    "report accepted"
                );
                Submission {
                    outcome: Outcome::Accepted(self.messages.thank_you.clone()),
                    marker: Some(report.marker),
                }
            }
            Err(FlagError::DuplicateReport(id)) => {
                info!(comment_id = %id, "duplicate report ignored");
                Submission::without_marker(Outcome::AlreadyFlagged(self.messages.already_flagged.clone()))
            }
            Err(FlagError::InvalidInput(reason)) => {
                warn!(%reason, "rejecting report");
                Submission::without_marker(Outcome::RejectedInvalid(self.messages.invalid_values.clone()))
            }
            Err(FlagError::Disabled) => {
                debug!("report received while flagging is disabled");
                Submission::without_marker(Outcome::RejectedInvalid(self.messages.disabled.clone()))
            }
            Err(err) => {
                error!(error = %err, "report could not be processed");
                Submission::without_marker(Outcome::RejectedInvalid(self.messages.unavailable.clone()))
            }
        }
    }
}
