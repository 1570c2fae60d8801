use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use mimir_core::{ContentClient, ContentError, WebhookRegistry};
use tracing::{info, warn};

use crate::config::{ConfigStore, MirrorConfig};
use crate::logging::LogFile;
use crate::sync::transfer::{TransferClient, TransferConfig};
use crate::sync::{Reconciler, SyncState, TransferPipeline, WebhookIngester};
use crate::tunnel::TunnelSupervisor;

pub const WEBHOOK_PATH: &str = "/webhook/mimir";
pub const WEBHOOK_LABEL: &str = "ROSS Folder Monitor";

/// Everything bound to one configuration value. Replaced wholesale when the binding changes.
pub struct Services {
    pub pipeline: Arc<TransferPipeline>,
    pub reconciler: Reconciler,
    pub ingester: WebhookIngester,
    pub registry: WebhookRegistry,
}

impl Services {
    pub fn build(
        config: &MirrorConfig,
        sync_state: &Arc<SyncState>,
        previous: Option<&Services>,
    ) -> Result<Self, ContentError> {
        let client = ContentClient::with_base_url(&config.api_base_url, config.credential.clone())?
            .with_timeout(config.request_timeout())?;
        let transfer = TransferClient::with_config(TransferConfig {
            download_concurrency: config.transfer_concurrency,
            ..TransferConfig::default()
        });
        let mut pipeline = TransferPipeline::new(
            client,
            transfer,
            config.download_directory.clone(),
            config.folder_id.clone(),
        );
        // Locks and the pass gate guard the directory; claims and dead letters also depend on
        // the folder.
        if let Some(previous) = previous.filter(|previous| {
            previous.pipeline.download_dir() == config.download_directory.as_path()
        }) {
            let shared = previous.pipeline.shared_state();
            pipeline = pipeline.with_shared_state(
                if previous.pipeline.folder_id() == config.folder_id {
                    shared.clone()
                } else {
                    shared.for_new_folder()
                },
            );
        }
        let pipeline = Arc::new(pipeline);

        Ok(Self {
            reconciler: Reconciler::new(Arc::clone(&pipeline), Arc::clone(sync_state))
                .with_concurrency(config.transfer_concurrency),
            ingester: WebhookIngester::new(Arc::clone(&pipeline), Arc::clone(sync_state)),
            registry: WebhookRegistry::with_base_url(
                &config.config_api_url,
                config.credential.clone(),
            )?,
            pipeline,
        })
    }
}

/// State shared by the daemon loops and the HTTP handlers.
pub struct AppState {
    pub config: ConfigStore,
    pub sync_state: Arc<SyncState>,
    pub registration: Arc<SyncState>,
    pub tunnel: TunnelSupervisor,
    pub logs: LogFile,
    services: RwLock<Arc<Services>>,
    started: Instant,
}

impl AppState {
    pub fn new(
        config: ConfigStore,
        tunnel: TunnelSupervisor,
        logs: LogFile,
    ) -> Result<Self, ContentError> {
        let sync_state = Arc::new(SyncState::new());
        let services = Services::build(&config.current(), &sync_state, None)?;
        Ok(Self {
            config,
            sync_state,
            registration: Arc::new(SyncState::new()),
            tunnel,
            logs,
            services: RwLock::new(Arc::new(services)),
            started: Instant::now(),
        })
    }

    pub fn services(&self) -> Arc<Services> {
        Arc::clone(&self.services.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps in services built from `config`; in-flight work keeps the old ones until it ends.
    pub fn rebuild_services(&self, config: &MirrorConfig) -> Result<Arc<Services>, ContentError> {
        let previous = self.services();
        let next = Arc::new(Services::build(config, &self.sync_state, Some(&previous))?);
        *self.services.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        info!(
            folder_id = %config.folder_id,
            dir = %config.download_directory.display(),
            "services rebuilt"
        );
        Ok(next)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Points the remote webhook at `public_base` and records the outcome.
    pub async fn register_webhook(&self, public_base: &str) {
        let target = format!("{}{WEBHOOK_PATH}", public_base.trim_end_matches('/'));
        let services = self.services();
        match services
            .registry
            .point_webhook_at(WEBHOOK_LABEL, WEBHOOK_PATH, &target)
            .await
        {
            Ok(Some(webhook)) => {
                info!(webhook_id = %webhook.id, url = %target, "webhook registration updated");
                self.registration.record_success();
            }
            Ok(None) => {
                warn!(label = WEBHOOK_LABEL, "no matching webhook to update");
                self.registration
                    .record_failure(format!("no webhook labelled \"{WEBHOOK_LABEL}\""));
            }
            Err(err) => {
                warn!(error = %err, "webhook registration failed");
                self.registration.record_failure(err.to_string());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tunnel::TunnelCommand;
    use crate::sync::PassResult;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn test_state(server: &MockServer, dir: &Path) -> AppState {
        let config = MirrorConfig {
            folder_id: "f1".into(),
            credential: "sakm.test-credential".into(),
            download_directory: dir.join("mirror"),
            api_base_url: server.uri(),
            config_api_url: format!("{}/config", server.uri()),
            log_file: Some(dir.join("app.log")),
            ..MirrorConfig::default()
        };
        let store = ConfigStore::new(config, dir.join("config.json"));
        let tunnel = TunnelSupervisor::new(TunnelCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
        })
        .unwrap();
        AppState::new(store, tunnel, LogFile::new(Some(dir.join("app.log")))).unwrap()
    }

    #[tokio::test]
    async fn rebuild_keeps_claims_for_same_directory() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let state = test_state(&server, dir.path());
        let before = state.services();
        before.pipeline.names().claim_local("local.png");

        let mut next = (*state.config.current()).clone();
        next.sync_interval_ms = 1000;
        let after = state.rebuild_services(&next).unwrap();
        assert!(Arc::ptr_eq(before.pipeline.names(), after.pipeline.names()));

        next.folder_id = "other".into();
        let moved = state.rebuild_services(&next).unwrap();
        assert!(!Arc::ptr_eq(after.pipeline.names(), moved.pipeline.names()));
        assert!(Arc::ptr_eq(after.pipeline.gate(), moved.pipeline.gate()));
        assert_eq!(state.services().pipeline.folder_id(), "other");

        next.download_directory = dir.path().join("elsewhere");
        let relocated = state.rebuild_services(&next).unwrap();
        assert!(!Arc::ptr_eq(moved.pipeline.gate(), relocated.pipeline.gate()));
    }

    #[tokio::test]
    async fn pass_on_rebuilt_services_waits_for_the_old_one() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/folders/f1/content"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"hits": [], "total": 0}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mirror")).unwrap();
        let state = Arc::new(test_state(&server, dir.path()));

        let old = state.services();
        let running = tokio::spawn(async move { old.reconciler.run_pass().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut next = (*state.config.current()).clone();
        next.transfer_concurrency = 8;
        let rebuilt = state.rebuild_services(&next).unwrap();
        assert!(rebuilt.reconciler.is_running());
        let second = rebuilt.reconciler.run_pass().await.unwrap();

        assert_eq!(second, PassResult::Coalesced);
        assert!(matches!(running.await.unwrap().unwrap(), PassResult::Completed(_)));
        assert!(!rebuilt.reconciler.is_running());
    }

    #[tokio::test]
    async fn registration_updates_matching_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config/webhooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "w1", "label": "Other", "url": "https://x.example/hook"},
                {"id": "w2", "label": "ROSS Folder Monitor", "url": "https://old.trycloudflare.com/webhook/mimir", "events": ["item_created"]}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/config/webhooks/w2"))
            .and(body_partial_json(json!({
                "url": "https://new-one.trycloudflare.com/webhook/mimir",
                "events": ["item_created"]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let state = test_state(&server, dir.path());

        state
            .register_webhook("https://new-one.trycloudflare.com/")
            .await;

        let status = state.registration.snapshot();
        assert!(status.synced);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn registration_without_match_records_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config/webhooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let state = test_state(&server, dir.path());

        state.register_webhook("https://a.trycloudflare.com").await;

        let status = state.registration.snapshot();
        assert!(!status.synced);
        assert!(status.error.unwrap().contains(WEBHOOK_LABEL));
    }
}
