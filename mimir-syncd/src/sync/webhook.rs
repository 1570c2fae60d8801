use std::sync::Arc;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{ErrorKind, SyncError};
use super::pipeline::{DownloadOutcome, TransferPipeline};
use super::state::SyncState;

pub const ITEM_CREATED: &str = "item_created";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub item: Option<EventItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventItem {
    pub id: String,
    #[serde(default)]
    pub item_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WebhookResponse {
    Ignored {
        event: String,
    },
    Skipped {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Success {
        message: String,
        item_id: String,
        title: Option<String>,
        file_name: String,
        written: bool,
    },
    Error {
        message: String,
        kind: ErrorKind,
    },
}

impl WebhookResponse {
    pub fn http_status(&self) -> StatusCode {
        match self {
            WebhookResponse::Error {
                kind: ErrorKind::Validation,
                ..
            } => StatusCode::BAD_REQUEST,
            WebhookResponse::Error { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::OK,
        }
    }

    fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        WebhookResponse::Error {
            message: message.into(),
            kind,
        }
    }
}

/// Turns item-creation notifications into single-item downloads.
pub struct WebhookIngester {
    pipeline: Arc<TransferPipeline>,
    state: Arc<SyncState>,
}

impl WebhookIngester {
    pub fn new(pipeline: Arc<TransferPipeline>, state: Arc<SyncState>) -> Self {
        Self { pipeline, state }
    }

    pub async fn handle(&self, event: &WebhookEvent) -> WebhookResponse {
        if event.event != ITEM_CREATED {
            info!(event = %event.event, "webhook event ignored");
            return WebhookResponse::Ignored {
                event: event.event.clone(),
            };
        }
        let Some(item) = &event.item else {
            warn!("item_created event without an item");
            return WebhookResponse::error(ErrorKind::Validation, "event carries no item");
        };
        info!(
            item_id = %item.id,
            item_type = item.item_type.as_deref().unwrap_or("unknown"),
            "webhook: item created"
        );

        let response = match self.pipeline.fetch_item(&item.id).await {
            Ok(full) if !full.is_in_folder(self.pipeline.folder_id()) => {
                info!(item_id = %item.id, "item is not in the watched folder");
                return WebhookResponse::Skipped {
                    message: "Not in watched folder".to_string(),
                };
            }
            Ok(full) => {
                let title = full.display_title().map(str::to_string);
                match self.pipeline.download(&full).await {
                    DownloadOutcome::Failed { reason, kind, .. } => {
                        WebhookResponse::error(kind, reason)
                    }
                    outcome => WebhookResponse::Success {
                        message: "Item processed".to_string(),
                        item_id: full.id.clone(),
                        title,
                        file_name: outcome.name().to_string(),
                        written: matches!(outcome, DownloadOutcome::Written { .. }),
                    },
                }
            }
            Err(err) => {
                let err = SyncError::from(err);
                WebhookResponse::error(err.kind(), err.to_string())
            }
        };

        match &response {
            WebhookResponse::Error { message, kind } => {
                warn!(item_id = %item.id, ?kind, error = %message, "webhook processing failed");
                self.state.record_failure(message.clone());
            }
            _ => self.state.record_success(),
        }
        response
    }
}
