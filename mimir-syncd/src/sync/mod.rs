pub mod backoff;
pub mod codec;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod flight;
pub mod local_watcher;
pub mod names;
pub mod pipeline;
pub mod state;
pub mod transfer;
pub mod webhook;

pub use engine::{PassResult, Reconciler};
pub use error::{ErrorKind, SyncError};
pub use pipeline::{DownloadOutcome, TransferPipeline, UploadOutcome, UploadStep};
pub use state::{PassReport, SyncState, SyncStatus};
pub use webhook::{WebhookEvent, WebhookIngester, WebhookResponse};
