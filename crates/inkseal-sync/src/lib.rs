//! inkseal-sync: the file encryption pipeline (compress, chunk, seal, wrap,
//! upload with retry, compensating rollback) and the bounded background
//! scheduler that runs it.

pub mod chunking;
pub mod compress;
pub mod content_cache;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod upload;

pub use content_cache::ContentCache;
pub use error::{SyncError, SyncResult};
pub use pipeline::{EncryptRequest, FileEncryptionPipeline, FileSource};
pub use progress::{progress_channel, ProgressSender, ProgressThrottle, ProgressUpdate, Stage};
pub use scheduler::{BackgroundTaskScheduler, CompletedTask, EncryptionTask, TaskEvent, TaskRunner};
pub use upload::{put_with_retry, RetryPolicy};
