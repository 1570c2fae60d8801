use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::{AUTH_HEADER, ContentError, auth_header_value, join_segments};

pub const DEFAULT_CONFIG_BASE_URL: &str = "https://mimir.mjoll.no/config/api/v1/config";

/// Client for the webhook section of the repository's configuration API.
#[derive(Clone)]
pub struct WebhookRegistry {
    http: Client,
    base_url: Url,
    token: String,
}

impl WebhookRegistry {
    pub fn new(token: impl Into<String>) -> Result<Self, ContentError> {
        Self::with_base_url(DEFAULT_CONFIG_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, ContentError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list_webhooks(&self) -> Result<Vec<WebhookConfig>, ContentError> {
        let url = join_segments(&self.base_url, &["webhooks"])?;
        let response = self
            .http
            .get(url)
            .header(AUTH_HEADER, auth_header_value(&self.token))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ContentError::Api { status, body });
        }
        Ok(response.json::<Option<Vec<WebhookConfig>>>().await?.unwrap_or_default())
    }

    pub async fn update_webhook(&self, webhook: &WebhookConfig) -> Result<(), ContentError> {
        let url = join_segments(&self.base_url, &["webhooks", &webhook.id])?;
        let response = self
            .http
            .put(url)
            .header(AUTH_HEADER, auth_header_value(&self.token))
            .json(webhook)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ContentError::Api { status, body })
        }
    }

    /// Points the matching webhook at `target_url`.
    ///
    /// Returns `Ok(None)` when no webhook matches; registration then has to be done by hand.
    pub async fn point_webhook_at(
        &self,
        label: &str,
        path_marker: &str,
        target_url: &str,
    ) -> Result<Option<WebhookConfig>, ContentError> {
        let webhooks = self.list_webhooks().await?;
        let Some(mut webhook) = find_webhook(webhooks, label, path_marker) else {
            return Ok(None);
        };
        webhook.url = Some(target_url.to_string());
        self.update_webhook(&webhook).await?;
        Ok(Some(webhook))
    }
}

pub fn find_webhook(
    webhooks: Vec<WebhookConfig>,
    label: &str,
    path_marker: &str,
) -> Option<WebhookConfig> {
    webhooks.into_iter().find(|webhook| {
        webhook.label.as_deref() == Some(label)
            || webhook
                .url
                .as_deref()
                .is_some_and(|url| url.contains(path_marker))
    })
}

/// A webhook record; fields this crate does not know about round-trip untouched.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WebhookConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
