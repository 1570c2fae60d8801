use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://mimir.mjoll.no/api/v1";
pub(crate) const AUTH_HEADER: &str = "x-mimir-cognito-id-token";
const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    BaseUrl(String),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("upload target response carried no upload url")]
    MissingUploadUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

impl ContentError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ContentError::Api { status, .. } => Some(*status),
            ContentError::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ContentError::Api { status, .. } => Some(classify_api_status(*status)),
            ContentError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            ContentError::Request(err) => err.status().map(classify_api_status),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Clone)]
pub struct ContentClient {
    http: Client,
    base_url: Url,
    token: String,
    page_size: u32,
}

impl ContentClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ContentError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, ContentError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ContentError> {
        self.http = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn fetch_item(&self, id: &str) -> Result<RemoteItem, ContentError> {
        let url = self.endpoint(&["items", id])?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn fetch_folder(&self, id: &str) -> Result<FolderMeta, ContentError> {
        let url = self.endpoint(&["folders", id])?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn list_folder_page(
        &self,
        id: &str,
        from: u64,
        size: u32,
    ) -> Result<FolderContents, ContentError> {
        let mut url = self.endpoint(&["folders", id, "content"])?;
        url.query_pairs_mut()
            .append_pair("from", &from.to_string())
            .append_pair("size", &size.to_string());
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    /// Drains every page of a folder listing.
    ///
    /// Stops when the reported `total` is reached, when a page comes back empty, or (for servers
    /// that omit `total`) when a page is shorter than requested.
    pub async fn list_folder_contents(&self, id: &str) -> Result<Vec<RemoteItem>, ContentError> {
        let size = self.page_size;
        let mut from = 0u64;
        let mut items = Vec::new();
        loop {
            let page = self.list_folder_page(id, from, size).await?;
            let received = page.hits.len() as u64;
            items.extend(page.hits);
            from = from.saturating_add(received);
            if received == 0 {
                break;
            }
            match page.total {
                Some(total) if from >= total => break,
                None if received < u64::from(size) => break,
                _ => {}
            }
        }
        Ok(items)
    }

    pub async fn create_item(&self, item: &NewItem) -> Result<String, ContentError> {
        let url = self.endpoint(&["items"])?;
        let response = self
            .authorized(self.http.post(url))
            .json(item)
            .send()
            .await?;
        let created: CreatedItem = Self::handle_response(response).await?;
        Ok(created.id)
    }

    pub async fn request_upload_target(
        &self,
        id: &str,
        parts: u32,
        file_name: &str,
    ) -> Result<UploadTarget, ContentError> {
        let url = self.endpoint(&["items", id, "upload", "multipart"])?;
        let response = self
            .authorized(self.http.post(url))
            .json(&UploadTargetRequest { parts, file_name })
            .send()
            .await?;
        let target: UploadTarget = Self::handle_response(response).await?;
        if target.part_url(0).is_none() {
            return Err(ContentError::MissingUploadUrl);
        }
        Ok(target)
    }

    pub async fn complete_upload(
        &self,
        id: &str,
        upload_id: Option<&str>,
        parts: &[CompletedPart],
    ) -> Result<(), ContentError> {
        let url = self.endpoint(&["items", id, "upload", "multipart", "complete"])?;
        let response = self
            .authorized(self.http.post(url))
            .json(&CompleteUploadRequest { upload_id, parts })
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    pub async fn attach_to_folder(
        &self,
        folder_id: &str,
        item_ids: &[String],
    ) -> Result<(), ContentError> {
        let url = self.endpoint(&["folders", folder_id, "content"])?;
        let response = self
            .authorized(self.http.put(url))
            .json(&AttachRequest { items: item_ids })
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTH_HEADER, auth_header_value(&self.token))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ContentError> {
        join_segments(&self.base_url, segments)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ContentError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), ContentError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> ContentError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ContentError::Api { status, body }
    }
}

pub(crate) fn auth_header_value(token: &str) -> String {
    format!("Bearer {token}")
}

pub(crate) fn join_segments(base: &Url, segments: &[&str]) -> Result<Url, ContentError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ContentError::BaseUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub id: String,
    #[serde(default)]
    pub original_file_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub media_size: Option<u64>,
    #[serde(default, rename = "highRes")]
    pub high_res_url: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default, rename = "lowRes")]
    pub low_res_url: Option<String>,
    #[serde(default)]
    pub folder_parents: Vec<String>,
    #[serde(default)]
    pub metadata: Option<ItemMetadata>,
}

impl RemoteItem {
    /// The name shown to users: explicit title, then the form title, then the upload name.
    pub fn display_title(&self) -> Option<&str> {
        non_empty(self.title.as_deref())
            .or_else(|| {
                non_empty(
                    self.metadata
                        .as_ref()
                        .and_then(|m| m.form_data.as_ref())
                        .and_then(|f| f.default_title.as_deref()),
                )
            })
            .or_else(|| non_empty(self.original_file_name.as_deref()))
    }

    pub fn is_in_folder(&self, folder_id: &str) -> bool {
        self.folder_parents.iter().any(|parent| parent == folder_id)
    }

    pub fn content_url(&self) -> Option<&str> {
        non_empty(self.high_res_url.as_deref())
    }

    pub fn preview_url(&self) -> Option<&str> {
        non_empty(self.thumbnail.as_deref()).or_else(|| non_empty(self.low_res_url.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ItemMetadata {
    #[serde(default, rename = "formData")]
    pub form_data: Option<FormData>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FormData {
    #[serde(default)]
    pub default_title: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "folderName")]
    pub folder_name: Option<String>,
}

impl FolderMeta {
    pub fn display_name(&self) -> Option<&str> {
        non_empty(self.name.as_deref())
            .or_else(|| non_empty(self.title.as_deref()))
            .or_else(|| non_empty(self.folder_name.as_deref()))
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FolderContents {
    #[serde(default)]
    pub hits: Vec<RemoteItem>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

impl ItemKind {
    pub fn from_file_name(name: &str) -> Self {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return ItemKind::Other;
        };
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "svg" => ItemKind::Image,
            "mp4" | "mov" | "avi" | "mkv" | "webm" | "flv" => ItemKind::Video,
            "mp3" | "wav" | "ogg" | "m4a" | "flac" => ItemKind::Audio,
            "pdf" | "doc" | "docx" | "txt" | "rtf" => ItemKind::Document,
            _ => ItemKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Image => "image",
            ItemKind::Video => "video",
            ItemKind::Audio => "audio",
            ItemKind::Document => "document",
            ItemKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub original_file_name: String,
    pub media_size: u64,
    pub item_type: ItemKind,
}

#[derive(Debug, Deserialize)]
struct CreatedItem {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadTargetRequest<'a> {
    parts: u32,
    file_name: &'a str,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub upload_id: Option<String>,
}

impl UploadTarget {
    pub fn part_url(&self, index: usize) -> Option<&str> {
        self.urls
            .get(index)
            .map(String::as_str)
            .or_else(|| if index == 0 { self.url.as_deref() } else { None })
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedPart {
    #[serde(rename = "ETag")]
    pub checksum_tag: String,
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteUploadRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    upload_id: Option<&'a str>,
    parts: &'a [CompletedPart],
}

#[derive(Debug, Serialize)]
struct AttachRequest<'a> {
    items: &'a [String],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_extensions_case_insensitively() {
        assert_eq!(ItemKind::from_file_name("a.JPG"), ItemKind::Image);
        assert_eq!(ItemKind::from_file_name("clip.webm"), ItemKind::Video);
        assert_eq!(ItemKind::from_file_name("song.Flac"), ItemKind::Audio);
        assert_eq!(ItemKind::from_file_name("notes.txt"), ItemKind::Document);
        assert_eq!(ItemKind::from_file_name("archive.zip"), ItemKind::Other);
        assert_eq!(ItemKind::from_file_name("README"), ItemKind::Other);
    }

    #[test]
    fn display_title_falls_back_to_form_then_file_name() {
        let mut item: RemoteItem = serde_json::from_value(serde_json::json!({
            "id": "1",
            "originalFileName": "IMG_1.jpg",
            "metadata": { "formData": { "default_title": "Form Title" } }
        }))
        .unwrap();
        assert_eq!(item.display_title(), Some("Form Title"));

        item.metadata = None;
        assert_eq!(item.display_title(), Some("IMG_1.jpg"));

        item.title = Some("Sunset Photo".into());
        assert_eq!(item.display_title(), Some("Sunset Photo"));
    }

    #[test]
    fn preview_prefers_thumbnail_over_low_res() {
        let mut item: RemoteItem = serde_json::from_value(serde_json::json!({
            "id": "1",
            "thumbnail": "",
            "lowRes": "https://cdn.example/low.jpg"
        }))
        .unwrap();
        assert_eq!(item.preview_url(), Some("https://cdn.example/low.jpg"));

        item.thumbnail = Some("https://cdn.example/thumb.jpg".into());
        assert_eq!(item.preview_url(), Some("https://cdn.example/thumb.jpg"));
    }

    #[test]
    fn upload_target_prefers_url_list() {
        let target = UploadTarget {
            urls: vec!["https://a".into()],
            url: Some("https://b".into()),
            upload_id: None,
        };
        assert_eq!(target.part_url(0), Some("https://a"));

        let single = UploadTarget {
            urls: Vec::new(),
            url: Some("https://b".into()),
            upload_id: None,
        };
        assert_eq!(single.part_url(0), Some("https://b"));
        assert_eq!(single.part_url(1), None);
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::NotFound
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_REQUEST),
            ApiErrorClass::Permanent
        );
    }
}
