use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub listed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub synced: bool,
    pub last_update: Option<String>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<PassReport>,
}

/// Process-wide status record. Writers replace the whole record at once, so readers never see
/// a mix of two updates.
#[derive(Debug, Default)]
pub struct SyncState {
    inner: RwLock<SyncStatus>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, status: SyncStatus) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn record_pass(&self, report: PassReport) {
        self.publish(SyncStatus {
            synced: report.failed == 0,
            last_update: Some(now_rfc3339()),
            error: (report.failed > 0).then(|| format!("{} item(s) failed", report.failed)),
            last_report: Some(report),
        });
    }

    /// Applies `change` under one write lock.
    fn update(&self, change: impl FnOnce(&mut SyncStatus)) {
        let mut status = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut status);
    }

    pub fn record_success(&self) {
        self.update(|status| {
            status.synced = true;
            status.last_update = Some(now_rfc3339());
            status.error = None;
        });
    }

    pub fn record_failure(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|status| {
            status.synced = false;
            status.last_update = Some(now_rfc3339());
            status.error = Some(message);
        });
    }
}

pub fn rfc3339(at: SystemTime) -> Option<String> {
    OffsetDateTime::from(at).format(&Rfc3339).ok()
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}
