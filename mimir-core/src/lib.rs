mod client;
mod webhooks;

pub use client::{
    ApiErrorClass, CompletedPart, ContentClient, ContentError, DEFAULT_BASE_URL, FolderContents,
    FolderMeta, FormData, ItemKind, ItemMetadata, NewItem, RemoteItem, UploadTarget,
};
pub use webhooks::{DEFAULT_CONFIG_BASE_URL, WebhookConfig, WebhookRegistry, find_webhook};
