pub mod config;
pub mod coordinator;
pub mod episode;
pub mod error;
pub mod feed;
pub mod http;
pub mod library;
pub mod model;
pub mod policy;
pub mod progress;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{Config, HttpConfig, RetryConfig};
pub use coordinator::{
    RefreshFailure, RefreshFailureKind, RefreshHandle, RefreshOutcome, RefreshSummary,
    SubscriptionRefresh,
};
pub use error::{ConfigError, DownloadError, FeedError, PipelineError, StoreError};
pub use http::{HttpClient, ReqwestClient, SharedHttpClient};
pub use library::{AddedSubscription, DeleteMode, Library};
pub use model::{
    DownloadStatus, Episode, EpisodeFilter, EpisodeId, FlagFilter, SortOrder, Subscription,
    SubscriptionId, SubscriptionSort,
};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use scheduler::{DownloadHandle, DownloadOutcome, EnqueueOutcome};
pub use settings::{PolicyOverride, Settings, SettingsHandle};
pub use store::{FileStore, MemoryStore, Repository, SharedRepository};
